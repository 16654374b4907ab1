use std::sync::Arc;

use crate::db::PredictionStore;
use crate::services::{
    class_names::ClassNameTable, detector::Detector, notifier::Notifier, queue::MessageQueue,
    storage::ObjectStore,
};

/// Explicitly constructed clients shared by the pipeline, the consumer loop
/// and the ops routes.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<dyn MessageQueue>,
    pub storage: Arc<dyn ObjectStore>,
    pub documents: Arc<dyn PredictionStore>,
    pub detector: Arc<dyn Detector>,
    pub class_names: Arc<ClassNameTable>,
    pub notifier: Option<Arc<dyn Notifier>>,
}

impl AppState {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        storage: Arc<dyn ObjectStore>,
        documents: Arc<dyn PredictionStore>,
        detector: Arc<dyn Detector>,
        class_names: ClassNameTable,
    ) -> Self {
        Self {
            queue,
            storage,
            documents,
            detector,
            class_names: Arc::new(class_names),
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }
}
