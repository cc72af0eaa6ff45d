use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::studio::error::StudioError;
use crate::studio::slot::ThemeSlot;

fn io_error(path: &Path, source: std::io::Error) -> StudioError {
    StudioError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Writes every rendered slot to `<out_dir>/<theme slug>.png`, in theme order.
///
/// Pending and failed slots are skipped. Consecutive writes are spaced by `stagger`.
/// A rendering that cannot be decoded for PNG conversion is written unchanged,
/// with the extension of its own MIME type.
pub async fn export_all(
    slots: &[ThemeSlot],
    out_dir: &Path,
    stagger: Duration,
) -> Result<Vec<PathBuf>, StudioError> {
    tokio::fs::create_dir_all(out_dir)
        .await
        .map_err(|err| io_error(out_dir, err))?;

    let mut written = Vec::new();
    for slot in slots {
        let Some(image) = slot.image() else {
            debug!(theme = %slot.theme(), status = slot.status().as_str(), "Skipping export");
            continue;
        };
        if !written.is_empty() && !stagger.is_zero() {
            tokio::time::sleep(stagger).await;
        }

        let (bytes, extension) = match image.png_bytes() {
            Ok(png) => (png, "png"),
            Err(err) => {
                warn!(
                    theme = %slot.theme(),
                    mime_type = image.mime_type(),
                    "Keeping original encoding: {}",
                    err
                );
                (image.bytes().into(), image.file_extension())
            }
        };
        let path = out_dir.join(format!("{}.{}", slot.theme().slug(), extension));
        tokio::fs::write(&path, bytes.as_ref())
            .await
            .map_err(|err| io_error(&path, err))?;
        info!(theme = %slot.theme(), path = %path.display(), "Saved rendering");
        written.push(path);
    }

    Ok(written)
}
