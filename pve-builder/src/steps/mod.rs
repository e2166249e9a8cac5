pub mod connect;
pub mod download_iso;
pub mod upload_iso;

pub use connect::StepConnect;
pub use download_iso::StepDownloadIso;
pub use upload_iso::StepUploadIso;
