#[cfg(test)]
mod tests {
    use crate::client::Uploader;
    use crate::config::{test_config, Config};
    use crate::multistep::tests::RecordingUi;
    use crate::multistep::{StateBag, Step, StepAction};
    use crate::steps::upload_iso::{iso_filename, StepUploadIso};
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use std::io::Write;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use tempfile::{NamedTempFile, TempDir};
    use tokio::fs::File;
    use tokio::io::AsyncReadExt;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct UploadCall {
        node: String,
        storage: String,
        content_type: String,
        filename: String,
        body: Vec<u8>,
        chunk_size: Option<i64>,
    }

    #[derive(Default)]
    struct FakeUploader {
        calls: Mutex<Vec<UploadCall>>,
        fail: bool,
    }

    impl FakeUploader {
        async fn record(
            &self,
            node: &str,
            storage: &str,
            content_type: &str,
            filename: &str,
            mut file: File,
            chunk_size: Option<i64>,
        ) -> Result<()> {
            let mut body = Vec::new();
            file.read_to_end(&mut body).await?;
            self.calls.lock().unwrap().push(UploadCall {
                node: node.to_string(),
                storage: storage.to_string(),
                content_type: content_type.to_string(),
                filename: filename.to_string(),
                body,
                chunk_size,
            });
            if self.fail {
                bail!("POST /nodes/{}/storage/{}/upload failed (500)", node, storage);
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Uploader for FakeUploader {
        async fn upload(
            &self,
            node: &str,
            storage: &str,
            content_type: &str,
            filename: &str,
            file: File,
        ) -> Result<()> {
            self.record(node, storage, content_type, filename, file, None)
                .await
        }

        async fn upload_chunked(
            &self,
            node: &str,
            storage: &str,
            content_type: &str,
            filename: &str,
            file: File,
            chunk_size: i64,
        ) -> Result<()> {
            self.record(node, storage, content_type, filename, file, Some(chunk_size))
                .await
        }
    }

    struct Harness {
        state: StateBag,
        uploader: Arc<FakeUploader>,
        ui: Arc<RecordingUi>,
    }

    fn harness(config: Config, uploader: FakeUploader, download_path: Option<PathBuf>) -> Harness {
        let uploader = Arc::new(uploader);
        let ui = Arc::new(RecordingUi::default());
        let mut state = StateBag::new(Arc::new(config), ui.clone());
        state.put_uploader(uploader.clone());
        if let Some(path) = download_path {
            state.put_download_path(path);
        }
        Harness {
            state,
            uploader,
            ui,
        }
    }

    fn iso_on_disk() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"ISO9660").unwrap();
        file.flush().unwrap();
        file
    }

    #[tokio::test]
    async fn test_preexisting_iso_is_passed_through() {
        let mut config = test_config();
        config.iso_file = "cephfs:iso/already-there.iso".to_string();
        let mut h = harness(config, FakeUploader::default(), None);

        let action = StepUploadIso.run(&mut h.state).await;

        assert_eq!(action, StepAction::Continue);
        assert_eq!(h.state.iso_file(), Some("cephfs:iso/already-there.iso"));
        assert!(h.uploader.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upload_publishes_decoded_storage_path() {
        let iso = iso_on_disk();
        let mut h = harness(
            test_config(),
            FakeUploader::default(),
            Some(iso.path().to_path_buf()),
        );

        let action = StepUploadIso.run(&mut h.state).await;

        assert_eq!(action, StepAction::Continue);
        assert_eq!(h.state.iso_file(), Some("local:iso/my disk.iso"));
        let calls = h.uploader.calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec![UploadCall {
                node: "pve1".to_string(),
                storage: "local".to_string(),
                content_type: "iso".to_string(),
                filename: "my disk.iso".to_string(),
                body: b"ISO9660".to_vec(),
                chunk_size: None,
            }]
        );
    }

    #[tokio::test]
    async fn test_positive_chunk_size_uses_chunked_upload() {
        let iso = iso_on_disk();
        let mut config = test_config();
        config.iso_upload_chunk_size = 4096;
        let mut h = harness(config, FakeUploader::default(), Some(iso.path().to_path_buf()));

        assert_eq!(StepUploadIso.run(&mut h.state).await, StepAction::Continue);

        let calls = h.uploader.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].chunk_size, Some(4096));
    }

    #[tokio::test]
    async fn test_non_positive_chunk_size_uses_single_upload() {
        for chunk_size in [0, -1] {
            let iso = iso_on_disk();
            let mut config = test_config();
            config.iso_upload_chunk_size = chunk_size;
            let mut h = harness(config, FakeUploader::default(), Some(iso.path().to_path_buf()));

            assert_eq!(StepUploadIso.run(&mut h.state).await, StepAction::Continue);

            let calls = h.uploader.calls.lock().unwrap();
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].chunk_size, None);
        }
    }

    #[tokio::test]
    async fn test_empty_download_path_halts() {
        for download_path in [None, Some(PathBuf::new())] {
            let mut h = harness(test_config(), FakeUploader::default(), download_path);

            let action = StepUploadIso.run(&mut h.state).await;

            assert_eq!(action, StepAction::Halt);
            assert_eq!(
                h.state.error().unwrap().to_string(),
                "Path to downloaded ISO was empty"
            );
            assert_eq!(
                *h.ui.errors.lock().unwrap(),
                vec!["Path to downloaded ISO was empty"]
            );
            assert!(h.uploader.calls.lock().unwrap().is_empty());
            assert_eq!(h.state.iso_file(), None);
        }
    }

    #[tokio::test]
    async fn test_missing_file_halts() {
        let dir = TempDir::new().unwrap();
        let mut h = harness(
            test_config(),
            FakeUploader::default(),
            Some(dir.path().join("missing.iso")),
        );

        assert_eq!(StepUploadIso.run(&mut h.state).await, StepAction::Halt);
        let err = format!("{:#}", h.state.error().unwrap());
        assert!(err.contains("Failed to open ISO"), "got: {}", err);
        assert!(h.uploader.calls.lock().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinked_download_is_followed() {
        let iso = iso_on_disk();
        let dir = TempDir::new().unwrap();
        let link = dir.path().join("link.iso");
        std::os::unix::fs::symlink(iso.path(), &link).unwrap();
        let mut h = harness(test_config(), FakeUploader::default(), Some(link));

        assert_eq!(StepUploadIso.run(&mut h.state).await, StepAction::Continue);
        assert_eq!(h.uploader.calls.lock().unwrap()[0].body, b"ISO9660".to_vec());
    }

    #[tokio::test]
    async fn test_malformed_url_halts_before_upload() {
        let iso = iso_on_disk();
        let mut config = test_config();
        config.iso_urls = vec!["http://[::1/broken.iso".to_string()];
        let mut h = harness(config, FakeUploader::default(), Some(iso.path().to_path_buf()));

        assert_eq!(StepUploadIso.run(&mut h.state).await, StepAction::Halt);
        let err = format!("{:#}", h.state.error().unwrap());
        assert!(err.contains("Invalid ISO URL"), "got: {}", err);
        assert!(h.uploader.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upload_failure_halts() {
        let iso = iso_on_disk();
        let uploader = FakeUploader {
            fail: true,
            ..Default::default()
        };
        let mut h = harness(test_config(), uploader, Some(iso.path().to_path_buf()));

        assert_eq!(StepUploadIso.run(&mut h.state).await, StepAction::Halt);
        assert!(h.state.error().unwrap().to_string().contains("failed (500)"));
        assert_eq!(h.ui.errors.lock().unwrap().len(), 1);
        assert_eq!(h.state.iso_file(), None);
    }

    #[tokio::test]
    async fn test_cleanup_is_noop() {
        let mut h = harness(test_config(), FakeUploader::default(), None);

        StepUploadIso.cleanup(&mut h.state).await;

        assert!(h.state.error().is_none());
        assert!(h.uploader.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_iso_filename_from_urls() {
        assert_eq!(
            iso_filename("https://releases.ubuntu.com/24.04/ubuntu-24.04-live-server-amd64.iso")
                .unwrap(),
            "ubuntu-24.04-live-server-amd64.iso"
        );
        assert_eq!(
            iso_filename("https://example.org/isos/my%20disk.iso?download=1").unwrap(),
            "my disk.iso"
        );
        assert_eq!(
            iso_filename("https://example.org/a+b.iso").unwrap(),
            "a b.iso"
        );
        assert_eq!(
            iso_filename("file:///var/lib/isos/debian-12.iso").unwrap(),
            "debian-12.iso"
        );
        assert_eq!(iso_filename("./isos/alpine.iso").unwrap(), "alpine.iso");
    }

    #[test]
    fn test_iso_filename_rejects_urls_without_name() {
        assert!(iso_filename("https://example.org/").is_err());
        assert!(iso_filename("http://[::1/broken.iso").is_err());
        assert!(iso_filename("https://example.org/isos/sub%2F..").is_err());
    }

    #[test]
    fn test_iso_filename_ignores_encoded_separators() {
        assert_eq!(
            iso_filename("https://mirror.example.org/isos/sub%2Fdir%2Fa.iso").unwrap(),
            "a.iso"
        );
        assert_eq!(
            iso_filename("https://mirror.example.org/isos/..%2F..%2F..%2Ftmp%2Fpwn.iso").unwrap(),
            "pwn.iso"
        );
    }
}
