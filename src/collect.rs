//! Dataset collector. Runs off the car: follows `/stream` and writes each
//! frame to disk under its label, so the file name carries sequence number,
//! direction flags and speed.

use crate::error::CollectError;
use crate::stream::{LabeledFrameRecord, MultipartReader};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// File name for a chunk label, or `None` if the label could escape the
/// output directory or does not look like a frame label.
fn file_name_for(label: &str) -> Option<&str> {
    let name = label.trim();
    if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
        return None;
    }
    if LabeledFrameRecord::parse_label(name, 0).is_none() {
        debug!(label = name, "label not in frame format, saving anyway");
    }
    Some(name)
}

/// Saves chunks from `reader` into `out_dir` until the stream ends or `limit`
/// frames have been written. Returns the number written.
pub fn collect<R: Read>(
    mut reader: MultipartReader<R>,
    out_dir: &Path,
    limit: Option<usize>,
) -> Result<usize, CollectError> {
    fs::create_dir_all(out_dir)?;
    let mut saved = 0;
    while limit.map_or(true, |l| saved < l) {
        let Some(chunk) = reader.next_chunk()? else {
            info!(saved, "stream ended");
            break;
        };
        let Some(name) = chunk.label.as_deref().and_then(file_name_for) else {
            warn!("chunk without usable label skipped");
            continue;
        };
        let path: PathBuf = out_dir.join(name);
        fs::write(&path, &chunk.data)?;
        info!("Saved {name}");
        saved += 1;
    }
    Ok(saved)
}

/// Requests `url` (the car's `/stream`) and collects frames from it.
pub fn collect_from(
    url: &str,
    out_dir: &Path,
    limit: Option<usize>,
) -> Result<usize, CollectError> {
    info!(url, "connecting to stream");
    let response = ureq::get(url).call()?;
    let content_type = response.header("Content-Type").unwrap_or("").to_string();
    if !content_type.to_lowercase().contains("multipart") {
        return Err(CollectError::NotMultipart(content_type));
    }
    debug!(%content_type, "stream accepted");
    collect(MultipartReader::new(response.into_reader()), out_dir, limit)
}
