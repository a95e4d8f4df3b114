use std::path::PathBuf;
use std::sync::Arc;

use medsignal_common::FileConfig;
use medsignal_pipeline::classify::LlmClient;
use medsignal_pipeline::feedback::FeedbackHandler;
use medsignal_store::Store;

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub llm: Arc<dyn LlmClient>,
    pub feedback: FeedbackHandler,
    pub config: FileConfig,
    pub reports_dir: PathBuf,
}
