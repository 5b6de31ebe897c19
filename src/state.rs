// Service state for voice-studio
// Wires the speaker store, training orchestrator and synthesis dispatcher together

use std::path::Path;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::database::SpeakerSummary;
use crate::error::VoiceResult;
use crate::speakers::SpeakerStore;
use crate::synthesis::{InferenceClient, SovitsApiClient, SynthesisDispatcher, SynthesisResult};
use crate::training::{
    TrainingHandle, TrainingJob, TrainingOrchestrator, TrainingRequest, TrainingStatusTracker,
};

pub struct VoiceService {
    config: Arc<AppConfig>,
    store: Arc<SpeakerStore>,
    tracker: Arc<TrainingStatusTracker>,
    orchestrator: Arc<TrainingOrchestrator>,
    dispatcher: SynthesisDispatcher,
}

impl VoiceService {
    /// Open the service against the configured HTTP inference API
    pub fn new(config: AppConfig) -> VoiceResult<Self> {
        let client = SovitsApiClient::new(&config.inference)?;
        Self::with_inference_client(config, Arc::new(client))
    }

    pub fn with_inference_client(
        config: AppConfig,
        client: Arc<dyn InferenceClient>,
    ) -> VoiceResult<Self> {
        let config = Arc::new(config);
        let store = Arc::new(SpeakerStore::open(&config)?);
        let tracker = Arc::new(TrainingStatusTracker::new());
        let orchestrator = Arc::new(TrainingOrchestrator::new(
            config.clone(),
            store.clone(),
            tracker.clone(),
        ));
        let dispatcher = SynthesisDispatcher::new(&config, store.clone(), client);

        log::info!("Voice service ready (data dir {})", config.data_dir.display());
        Ok(Self {
            config,
            store,
            tracker,
            orchestrator,
            dispatcher,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<SpeakerStore> {
        &self.store
    }

    pub fn orchestrator(&self) -> &Arc<TrainingOrchestrator> {
        &self.orchestrator
    }

    /// Import an uploaded clip; returns the speaker's sample count
    pub fn upload_sample(
        &self,
        speaker: &str,
        upload_path: &Path,
        transcript: Option<String>,
    ) -> VoiceResult<usize> {
        self.store.import_upload(speaker, upload_path, transcript)
    }

    /// Validate and start a background training run
    pub fn start_training(&self, request: TrainingRequest) -> VoiceResult<TrainingHandle> {
        self.orchestrator.spawn_training(request)
    }

    /// Start training with the configured epochs and batch size
    pub fn start_default_training(&self, speaker: &str) -> VoiceResult<TrainingHandle> {
        self.start_training(self.orchestrator.default_request(speaker))
    }

    /// Current job state; unknown speakers report `not_started`
    pub fn training_status(&self, speaker: &str) -> TrainingJob {
        self.tracker.get(speaker)
    }

    pub async fn generate(
        &self,
        text: &str,
        speaker: &str,
        language: &str,
    ) -> VoiceResult<SynthesisResult> {
        self.dispatcher.generate(text, speaker, language).await
    }

    pub fn list_speakers(&self) -> VoiceResult<Vec<SpeakerSummary>> {
        self.store.list()
    }

    /// Delete a speaker unless a training run is using it
    pub fn delete_speaker(&self, speaker: &str) -> VoiceResult<()> {
        // Claiming the job slot keeps a run from starting mid-delete
        let previous = match self.tracker.try_begin(speaker, 0) {
            Ok(previous) => previous,
            Err(err) => {
                log::warn!("Refusing to delete '{}' while it is training", speaker);
                return Err(err);
            }
        };

        match self.store.delete(speaker) {
            Ok(()) => {
                self.tracker.remove(speaker);
                Ok(())
            }
            Err(err) => {
                self.tracker.restore(speaker, previous);
                Err(err)
            }
        }
    }
}
