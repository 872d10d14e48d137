//! S3 XML bodies.
//!
//! Responses are written with a manual `quick_xml::Writer` following the
//! AWS RestXml conventions: the 2006-03-01 namespace on the root element,
//! lowercase booleans, ISO 8601 timestamps with milliseconds. Request
//! bodies (completion lists, batch deletes, configuration documents) are
//! read with a streaming `quick_xml::Reader` into flat structures.

use std::collections::HashMap;
use std::io::Write;

use chrono::{DateTime, Utc};
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesText, Event};

use maxiofs_core::ids::NULL_VERSION_ID;
use maxiofs_core::types::{
    DefaultRetention, MultipartUpload, ObjectRecord, Retention, RetentionMode, UploadPart,
    VersioningState,
};
use maxiofs_core::{Error, Result};
use maxiofs_engine::list::{ListObjectsOutput, ListVersionsOutput};
use maxiofs_engine::multipart::CompletedPart;

/// The S3 XML namespace.
pub const S3_NAMESPACE: &str = "http://s3.amazonaws.com/doc/2006-03-01/";

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

fn document(root: &str, fill: impl FnOnce(&mut Writer<&mut Vec<u8>>) -> std::io::Result<()>) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(512);
    let mut writer = Writer::new(&mut buf);
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_err)?;
    writer
        .create_element(root)
        .with_attribute(("xmlns", S3_NAMESPACE))
        .write_inner_content(fill)
        .map_err(xml_err)?;
    Ok(buf)
}

fn xml_err<E: std::fmt::Display>(e: E) -> Error {
    Error::Internal(anyhow::anyhow!("xml serialization: {e}"))
}

fn text<W: Write>(w: &mut Writer<W>, tag: &str, value: &str) -> std::io::Result<()> {
    w.create_element(tag)
        .write_text_content(BytesText::new(value))?;
    Ok(())
}

fn format_timestamp(epoch_secs: i64) -> String {
    DateTime::<Utc>::from_timestamp(epoch_secs, 0)
        .unwrap_or_default()
        .format("%Y-%m-%dT%H:%M:%S%.3fZ")
        .to_string()
}

/// `<Error>` body.
pub fn error_body(code: &str, message: &str, resource: &str) -> Vec<u8> {
    // The error document carries no namespace.
    let mut buf = Vec::with_capacity(256);
    let mut writer = Writer::new(&mut buf);
    let _ = writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)));
    let _ = writer.create_element("Error").write_inner_content(|w| {
        text(w, "Code", code)?;
        text(w, "Message", message)?;
        text(w, "Resource", resource)?;
        Ok(())
    });
    buf
}

/// `ListAllMyBucketsResult`.
pub fn list_buckets(owner_id: &str, buckets: &[(String, i64)]) -> Result<Vec<u8>> {
    document("ListAllMyBucketsResult", |w| {
        w.create_element("Owner").write_inner_content(|w| {
            text(w, "ID", owner_id)?;
            text(w, "DisplayName", owner_id)?;
            Ok(())
        })?;
        w.create_element("Buckets").write_inner_content(|w| {
            for (name, created_at) in buckets {
                w.create_element("Bucket").write_inner_content(|w| {
                    text(w, "Name", name)?;
                    text(w, "CreationDate", &format_timestamp(*created_at))?;
                    Ok(())
                })?;
            }
            Ok(())
        })?;
        Ok(())
    })
}

fn write_contents<W: Write>(w: &mut Writer<W>, objects: &[ObjectRecord]) -> std::io::Result<()> {
    for object in objects {
        w.create_element("Contents").write_inner_content(|w| {
            text(w, "Key", &object.key)?;
            text(w, "LastModified", &format_timestamp(object.created_at))?;
            text(w, "ETag", &object.etag)?;
            text(w, "Size", &object.size.to_string())?;
            text(w, "StorageClass", "STANDARD")?;
            Ok(())
        })?;
    }
    Ok(())
}

fn write_common_prefixes<W: Write>(w: &mut Writer<W>, prefixes: &[String]) -> std::io::Result<()> {
    for prefix in prefixes {
        w.create_element("CommonPrefixes").write_inner_content(|w| {
            text(w, "Prefix", prefix)?;
            Ok(())
        })?;
    }
    Ok(())
}

/// `ListBucketResult` (V1).
pub fn list_objects_v1(
    bucket: &str,
    prefix: &str,
    delimiter: Option<&str>,
    marker: Option<&str>,
    max_keys: usize,
    output: &ListObjectsOutput,
) -> Result<Vec<u8>> {
    document("ListBucketResult", |w| {
        text(w, "Name", bucket)?;
        text(w, "Prefix", prefix)?;
        text(w, "Marker", marker.unwrap_or(""))?;
        if let Some(delimiter) = delimiter {
            text(w, "Delimiter", delimiter)?;
        }
        text(w, "MaxKeys", &max_keys.to_string())?;
        text(w, "IsTruncated", if output.is_truncated { "true" } else { "false" })?;
        if let Some(next) = &output.next_after_key {
            if output.is_truncated {
                text(w, "NextMarker", next)?;
            }
        }
        write_contents(w, &output.objects)?;
        write_common_prefixes(w, &output.common_prefixes)?;
        Ok(())
    })
}

/// `ListBucketResult` (V2).
pub fn list_objects_v2(
    bucket: &str,
    prefix: &str,
    delimiter: Option<&str>,
    continuation: Option<&str>,
    max_keys: usize,
    output: &ListObjectsOutput,
) -> Result<Vec<u8>> {
    document("ListBucketResult", |w| {
        text(w, "Name", bucket)?;
        text(w, "Prefix", prefix)?;
        if let Some(delimiter) = delimiter {
            text(w, "Delimiter", delimiter)?;
        }
        text(w, "MaxKeys", &max_keys.to_string())?;
        text(
            w,
            "KeyCount",
            &(output.objects.len() + output.common_prefixes.len()).to_string(),
        )?;
        text(w, "IsTruncated", if output.is_truncated { "true" } else { "false" })?;
        if let Some(token) = continuation {
            text(w, "ContinuationToken", token)?;
        }
        if output.is_truncated {
            if let Some(next) = &output.next_after_key {
                text(w, "NextContinuationToken", next)?;
            }
        }
        write_contents(w, &output.objects)?;
        write_common_prefixes(w, &output.common_prefixes)?;
        Ok(())
    })
}

/// `ListVersionsResult`.
pub fn list_versions(bucket: &str, prefix: &str, output: &ListVersionsOutput) -> Result<Vec<u8>> {
    document("ListVersionsResult", |w| {
        text(w, "Name", bucket)?;
        text(w, "Prefix", prefix)?;
        text(w, "IsTruncated", if output.is_truncated { "true" } else { "false" })?;
        if let Some((key, version)) = &output.next_marker {
            text(w, "NextKeyMarker", key)?;
            text(w, "NextVersionIdMarker", version)?;
        }

        // The newest row per key is the latest version.
        let mut latest_seen: Option<&str> = None;
        for record in &output.versions {
            let is_latest = latest_seen != Some(record.key.as_str());
            latest_seen = Some(record.key.as_str());

            let element = if record.is_delete_marker {
                "DeleteMarker"
            } else {
                "Version"
            };
            w.create_element(element).write_inner_content(|w| {
                text(w, "Key", &record.key)?;
                text(w, "VersionId", &record.version_id)?;
                text(w, "IsLatest", if is_latest { "true" } else { "false" })?;
                text(w, "LastModified", &format_timestamp(record.created_at))?;
                if !record.is_delete_marker {
                    text(w, "ETag", &record.etag)?;
                    text(w, "Size", &record.size.to_string())?;
                    text(w, "StorageClass", "STANDARD")?;
                }
                Ok(())
            })?;
        }
        write_common_prefixes(w, &output.common_prefixes)?;
        Ok(())
    })
}

/// `InitiateMultipartUploadResult`.
pub fn initiate_multipart(upload: &MultipartUpload) -> Result<Vec<u8>> {
    document("InitiateMultipartUploadResult", |w| {
        text(w, "Bucket", &upload.bucket)?;
        text(w, "Key", &upload.key)?;
        text(w, "UploadId", &upload.upload_id)?;
        Ok(())
    })
}

/// `CompleteMultipartUploadResult`.
pub fn complete_multipart(bucket: &str, key: &str, location: &str, etag: &str) -> Result<Vec<u8>> {
    document("CompleteMultipartUploadResult", |w| {
        text(w, "Location", location)?;
        text(w, "Bucket", bucket)?;
        text(w, "Key", key)?;
        text(w, "ETag", etag)?;
        Ok(())
    })
}

/// `ListPartsResult`.
pub fn list_parts(upload: &MultipartUpload, parts: &[UploadPart]) -> Result<Vec<u8>> {
    document("ListPartsResult", |w| {
        text(w, "Bucket", &upload.bucket)?;
        text(w, "Key", &upload.key)?;
        text(w, "UploadId", &upload.upload_id)?;
        text(w, "IsTruncated", "false")?;
        for part in parts {
            w.create_element("Part").write_inner_content(|w| {
                text(w, "PartNumber", &part.part_number.to_string())?;
                text(w, "LastModified", &format_timestamp(part.uploaded_at))?;
                text(w, "ETag", &format!("\"{}\"", part.etag))?;
                text(w, "Size", &part.size.to_string())?;
                Ok(())
            })?;
        }
        Ok(())
    })
}

/// `ListMultipartUploadsResult`.
pub fn list_multipart_uploads(bucket: &str, uploads: &[MultipartUpload]) -> Result<Vec<u8>> {
    document("ListMultipartUploadsResult", |w| {
        text(w, "Bucket", bucket)?;
        text(w, "IsTruncated", "false")?;
        for upload in uploads {
            w.create_element("Upload").write_inner_content(|w| {
                text(w, "Key", &upload.key)?;
                text(w, "UploadId", &upload.upload_id)?;
                text(w, "Initiated", &format_timestamp(upload.initiated_at))?;
                Ok(())
            })?;
        }
        Ok(())
    })
}

/// `CopyObjectResult`.
pub fn copy_object(etag: &str, last_modified: i64) -> Result<Vec<u8>> {
    document("CopyObjectResult", |w| {
        text(w, "ETag", etag)?;
        text(w, "LastModified", &format_timestamp(last_modified))?;
        Ok(())
    })
}

/// `DeleteResult` for batch deletes.
pub fn delete_result(
    deleted: &[(String, Option<String>)],
    errors: &[(String, String, String)],
    quiet: bool,
) -> Result<Vec<u8>> {
    document("DeleteResult", |w| {
        if !quiet {
            for (key, version_id) in deleted {
                w.create_element("Deleted").write_inner_content(|w| {
                    text(w, "Key", key)?;
                    if let Some(version_id) = version_id {
                        text(w, "VersionId", version_id)?;
                    }
                    Ok(())
                })?;
            }
        }
        for (key, code, message) in errors {
            w.create_element("Error").write_inner_content(|w| {
                text(w, "Key", key)?;
                text(w, "Code", code)?;
                text(w, "Message", message)?;
                Ok(())
            })?;
        }
        Ok(())
    })
}

/// `LocationConstraint`.
pub fn location_constraint(region: Option<&str>) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(160);
    let mut writer = Writer::new(&mut buf);
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_err)?;
    writer
        .create_element("LocationConstraint")
        .with_attribute(("xmlns", S3_NAMESPACE))
        .write_text_content(BytesText::new(region.unwrap_or("")))
        .map_err(xml_err)?;
    Ok(buf)
}

/// `VersioningConfiguration`.
pub fn versioning_configuration(state: VersioningState) -> Result<Vec<u8>> {
    document("VersioningConfiguration", |w| {
        if let Some(status) = state.as_wire_str() {
            text(w, "Status", status)?;
        }
        Ok(())
    })
}

/// `Tagging`.
pub fn tagging(tags: &[(String, String)]) -> Result<Vec<u8>> {
    document("Tagging", |w| {
        w.create_element("TagSet").write_inner_content(|w| {
            for (tag_key, tag_value) in tags {
                w.create_element("Tag").write_inner_content(|w| {
                    text(w, "Key", tag_key)?;
                    text(w, "Value", tag_value)?;
                    Ok(())
                })?;
            }
            Ok(())
        })?;
        Ok(())
    })
}

/// `Retention`.
pub fn retention(value: Option<Retention>) -> Result<Vec<u8>> {
    document("Retention", |w| {
        if let Some(retention) = value {
            text(w, "Mode", retention.mode.as_str())?;
            text(w, "RetainUntilDate", &format_timestamp(retention.until))?;
        }
        Ok(())
    })
}

/// `LegalHold`.
pub fn legal_hold(on: bool) -> Result<Vec<u8>> {
    document("LegalHold", |w| {
        text(w, "Status", if on { "ON" } else { "OFF" })?;
        Ok(())
    })
}

/// `ObjectLockConfiguration`.
pub fn object_lock_configuration(
    enabled: bool,
    default_retention: Option<DefaultRetention>,
) -> Result<Vec<u8>> {
    document("ObjectLockConfiguration", |w| {
        if enabled {
            text(w, "ObjectLockEnabled", "Enabled")?;
        }
        if let Some(default) = default_retention {
            w.create_element("Rule").write_inner_content(|w| {
                w.create_element("DefaultRetention").write_inner_content(|w| {
                    text(w, "Mode", default.mode.as_str())?;
                    let days = (default.period_secs / 86_400).max(1);
                    text(w, "Days", &days.to_string())?;
                    Ok(())
                })?;
                Ok(())
            })?;
        }
        Ok(())
    })
}

/// `GetObjectAclResult` for the limited ACL surface: the bucket owner has
/// full control, nothing else is expressible.
pub fn object_acl(owner_id: &str) -> Result<Vec<u8>> {
    document("AccessControlPolicy", |w| {
        w.create_element("Owner").write_inner_content(|w| {
            text(w, "ID", owner_id)?;
            Ok(())
        })?;
        w.create_element("AccessControlList").write_inner_content(|w| {
            w.create_element("Grant").write_inner_content(|w| {
                w.create_element("Grantee")
                    .with_attribute(("xmlns:xsi", "http://www.w3.org/2001/XMLSchema-instance"))
                    .with_attribute(("xsi:type", "CanonicalUser"))
                    .write_inner_content(|w| {
                        text(w, "ID", owner_id)?;
                        Ok(())
                    })?;
                text(w, "Permission", "FULL_CONTROL")?;
                Ok(())
            })?;
            Ok(())
        })?;
        Ok(())
    })
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Decode and unescape a text event.
fn text_value(content: &quick_xml::events::BytesText<'_>) -> Result<String> {
    let decoded = content.decode().map_err(|_| Error::MalformedXml)?;
    let unescaped = quick_xml::escape::unescape(&decoded).map_err(|_| Error::MalformedXml)?;
    Ok(unescaped.into_owned())
}

/// Collect repeated `<group>` elements into flat `tag → text` maps.
fn collect_groups(xml: &[u8], group: &str) -> Result<Vec<HashMap<String, String>>> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut groups = Vec::new();
    let mut current: Option<HashMap<String, String>> = None;
    let mut leaf: Option<String> = None;

    loop {
        match reader.read_event().map_err(|_| Error::MalformedXml)? {
            Event::Start(start) => {
                let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                if name == group {
                    current = Some(HashMap::new());
                } else if current.is_some() {
                    leaf = Some(name);
                }
            }
            Event::Text(content) => {
                if let (Some(map), Some(tag)) = (current.as_mut(), leaf.as_ref()) {
                    map.insert(tag.clone(), text_value(&content)?);
                }
            }
            Event::End(end) => {
                let name = String::from_utf8_lossy(end.name().as_ref()).into_owned();
                if name == group {
                    if let Some(map) = current.take() {
                        groups.push(map);
                    }
                } else if leaf.as_deref() == Some(name.as_str()) {
                    leaf = None;
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(groups)
}

/// Text content of the first `<tag>` in the document.
fn leaf_text(xml: &[u8], tag: &str) -> Result<Option<String>> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut inside = false;

    loop {
        match reader.read_event().map_err(|_| Error::MalformedXml)? {
            Event::Start(start) => {
                inside = start.name().as_ref() == tag.as_bytes();
            }
            Event::Text(content) if inside => {
                return Ok(Some(text_value(&content)?));
            }
            Event::End(_) => inside = false,
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

/// Parse a `CompleteMultipartUpload` request body.
pub fn parse_complete_multipart(xml: &[u8]) -> Result<Vec<CompletedPart>> {
    let groups = collect_groups(xml, "Part")?;
    if groups.is_empty() {
        return Err(Error::MalformedXml);
    }
    groups
        .into_iter()
        .map(|map| {
            let part_number = map
                .get("PartNumber")
                .and_then(|v| v.parse().ok())
                .ok_or(Error::MalformedXml)?;
            let etag = map.get("ETag").cloned().ok_or(Error::MalformedXml)?;
            Ok(CompletedPart { part_number, etag })
        })
        .collect()
}

/// Parse a batch `Delete` request body into `(keys, quiet)`.
pub fn parse_batch_delete(xml: &[u8]) -> Result<(Vec<(String, Option<String>)>, bool)> {
    let quiet = leaf_text(xml, "Quiet")?.as_deref() == Some("true");
    let objects = collect_groups(xml, "Object")?;
    if objects.is_empty() {
        return Err(Error::MalformedXml);
    }
    if objects.len() > 1000 {
        return Err(Error::invalid_argument(
            "batch delete is limited to 1000 keys",
        ));
    }
    let keys = objects
        .into_iter()
        .map(|map| {
            let key = map.get("Key").cloned().ok_or(Error::MalformedXml)?;
            let version_id = map
                .get("VersionId")
                .cloned()
                .filter(|v| !v.is_empty() && v != NULL_VERSION_ID);
            Ok((key, version_id))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok((keys, quiet))
}

/// Parse a `VersioningConfiguration` body.
pub fn parse_versioning(xml: &[u8]) -> Result<VersioningState> {
    match leaf_text(xml, "Status")?.as_deref() {
        Some("Enabled") => Ok(VersioningState::Enabled),
        Some("Suspended") => Ok(VersioningState::Suspended),
        Some(_) => Err(Error::MalformedXml),
        None => Ok(VersioningState::Off),
    }
}

/// Parse a `Tagging` body.
pub fn parse_tagging(xml: &[u8]) -> Result<Vec<(String, String)>> {
    collect_groups(xml, "Tag")?
        .into_iter()
        .map(|map| {
            let key = map.get("Key").cloned().ok_or(Error::MalformedXml)?;
            let value = map.get("Value").cloned().unwrap_or_default();
            Ok((key, value))
        })
        .collect()
}

/// Parse a `Retention` body. An empty document clears retention.
pub fn parse_retention(xml: &[u8]) -> Result<Option<Retention>> {
    let Some(mode_text) = leaf_text(xml, "Mode")? else {
        return Ok(None);
    };
    let mode: RetentionMode = mode_text.parse()?;
    let until_text = leaf_text(xml, "RetainUntilDate")?.ok_or(Error::MalformedXml)?;
    let until = DateTime::parse_from_rfc3339(&until_text)
        .map_err(|_| Error::MalformedXml)?
        .timestamp();
    Ok(Some(Retention { mode, until }))
}

/// Parse a `LegalHold` body.
pub fn parse_legal_hold(xml: &[u8]) -> Result<bool> {
    match leaf_text(xml, "Status")?.as_deref() {
        Some("ON") => Ok(true),
        Some("OFF") => Ok(false),
        _ => Err(Error::MalformedXml),
    }
}

/// Parse an `ObjectLockConfiguration` body into a default retention.
pub fn parse_object_lock_configuration(xml: &[u8]) -> Result<Option<DefaultRetention>> {
    let Some(mode_text) = leaf_text(xml, "Mode")? else {
        return Ok(None);
    };
    let mode: RetentionMode = mode_text.parse()?;
    let period_secs = if let Some(days) = leaf_text(xml, "Days")? {
        days.parse::<u64>().map_err(|_| Error::MalformedXml)? * 86_400
    } else if let Some(years) = leaf_text(xml, "Years")? {
        years.parse::<u64>().map_err(|_| Error::MalformedXml)? * 365 * 86_400
    } else {
        return Err(Error::MalformedXml);
    };
    Ok(Some(DefaultRetention { mode, period_secs }))
}
