use base64::Engine as _;
use std::path::PathBuf;

/// Opaque image persistence: the relay hands decoded bytes in, a URL the
/// caller can fetch comes out. The default sink writes under the data dir;
/// deployments front it with their own static file server.
pub trait ImageSink: Send + Sync {
    fn save_image(&self, mime_type: &str, base64_data: &str) -> Result<String, String>;
}

pub struct DiskImageSink {
    dir: PathBuf,
    base_url: String,
}

impl DiskImageSink {
    pub fn new(dir: PathBuf, base_url: String) -> Self {
        Self {
            dir,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn extension_for(mime_type: &str) -> &'static str {
        match mime_type {
            "image/jpeg" | "image/jpg" => "jpg",
            "image/webp" => "webp",
            "image/gif" => "gif",
            _ => "png",
        }
    }
}

impl ImageSink for DiskImageSink {
    fn save_image(&self, mime_type: &str, base64_data: &str) -> Result<String, String> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(base64_data)
            .map_err(|e| format!("image payload decode failed: {}", e))?;
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| format!("image dir create failed: {}", e))?;
        let name = format!(
            "{}.{}",
            uuid::Uuid::new_v4().simple(),
            Self::extension_for(mime_type)
        );
        let path = self.dir.join(&name);
        std::fs::write(&path, bytes).map_err(|e| format!("image write failed: {}", e))?;
        tracing::debug!("Saved generated image to {:?}", path);
        Ok(format!("{}/images/{}", self.base_url, name))
    }
}

/// Fallback when no base URL is configured: the image is returned inline as
/// a data URL so callers still see something renderable.
pub struct InlineImageSink;

impl ImageSink for InlineImageSink {
    fn save_image(&self, mime_type: &str, base64_data: &str) -> Result<String, String> {
        Ok(format!("data:{};base64,{}", mime_type, base64_data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_sink_writes_and_returns_url() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DiskImageSink::new(dir.path().to_path_buf(), "http://localhost:8317/".into());
        // 1x1 transparent PNG.
        let data = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";
        let url = sink.save_image("image/png", data).unwrap();
        assert!(url.starts_with("http://localhost:8317/images/"));
        assert!(url.ends_with(".png"));
        let name = url.rsplit('/').next().unwrap();
        assert!(dir.path().join(name).exists());
    }

    #[test]
    fn inline_sink_produces_data_url() {
        let sink = InlineImageSink;
        let url = sink.save_image("image/png", "QUJD").unwrap();
        assert_eq!(url, "data:image/png;base64,QUJD");
    }

    #[test]
    fn invalid_base64_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DiskImageSink::new(dir.path().to_path_buf(), "http://x".into());
        assert!(sink.save_image("image/png", "!!not-base64!!").is_err());
    }
}
