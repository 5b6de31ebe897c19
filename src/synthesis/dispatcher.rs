//! Synthesis dispatcher
//!
//! Picks a generation path for a speaker: the trained model pair when one is
//! recorded, the service's pretrained weights conditioned on reference clips
//! otherwise, and a silent placeholder clip when the service is down. The
//! placeholder path is tagged so it is never mistaken for real output.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::client::{InferenceClient, TtsRequest};
use crate::audio::wav::{write_silence, PLACEHOLDER_SAMPLE_RATE};
use crate::config::AppConfig;
use crate::database::{AudioSample, Speaker};
use crate::error::{VoiceError, VoiceResult};
use crate::reference::{select_references, ReferenceSelection};
use crate::speakers::SpeakerStore;

pub const DEFAULT_LANGUAGE: &str = "zh";

/// Auxiliary references sent with a trained model
const TRAINED_AUX_REFERENCES: usize = 3;
/// Auxiliary references sent with the pretrained weights
const PRETRAINED_AUX_REFERENCES: usize = 5;

const IDEOGRAPHIC_SECS_PER_CHAR: f64 = 0.3;
const SECS_PER_WORD: f64 = 0.2;
const MIN_PLACEHOLDER_SECS: f64 = 1.0;
const MAX_PLACEHOLDER_SECS: f64 = 30.0;

/// Which path produced the audio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisMode {
    Trained,
    PretrainedReference,
    /// Silent clip; the inference service was unreachable
    Placeholder,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisResult {
    pub output_path: PathBuf,
    pub mode: SynthesisMode,
    pub speaker: String,
    pub language: String,
    pub reference_path: Option<String>,
    pub warning: Option<String>,
}

/// Collapse regional variants to the base language code
pub fn normalize_language(language: &str) -> String {
    let base = language
        .trim()
        .split(['-', '_'])
        .next()
        .unwrap_or_default()
        .to_lowercase();
    if base.is_empty() {
        DEFAULT_LANGUAGE.to_string()
    } else {
        base
    }
}

fn is_ideographic(language: &str) -> bool {
    matches!(language, "zh" | "ja" | "yue")
}

/// Length of the silent clip standing in for `text`
pub fn estimate_placeholder_duration(text: &str, language: &str) -> f64 {
    let estimate = if is_ideographic(language) {
        text.chars().filter(|c| !c.is_whitespace()).count() as f64 * IDEOGRAPHIC_SECS_PER_CHAR
    } else {
        text.split_whitespace().count() as f64 * SECS_PER_WORD
    };
    estimate.clamp(MIN_PLACEHOLDER_SECS, MAX_PLACEHOLDER_SECS)
}

fn absolute(path: &str) -> String {
    let path = Path::new(path);
    if path.is_absolute() {
        return path.to_string_lossy().into_owned();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .into_owned()
}

pub struct SynthesisDispatcher {
    store: Arc<SpeakerStore>,
    client: Arc<dyn InferenceClient>,
    outputs_dir: PathBuf,
    weights_settle: Duration,
}

impl SynthesisDispatcher {
    pub fn new(
        config: &AppConfig,
        store: Arc<SpeakerStore>,
        client: Arc<dyn InferenceClient>,
    ) -> Self {
        Self {
            store,
            client,
            outputs_dir: config.outputs_dir(),
            weights_settle: Duration::from_millis(config.inference.weights_settle_ms),
        }
    }

    /// Generate speech for `text` in `speaker`'s voice
    pub async fn generate(
        &self,
        text: &str,
        speaker: &str,
        language: &str,
    ) -> VoiceResult<SynthesisResult> {
        if text.trim().is_empty() {
            return Err(VoiceError::InvalidInput("text is empty".to_string()));
        }
        let language = normalize_language(language);
        let record = self.store.get(speaker)?;

        let usable: Vec<AudioSample> = record
            .samples
            .iter()
            .filter(|s| Path::new(&s.storage_path).is_file())
            .cloned()
            .collect();
        let model_pair = trained_pair(&record);
        if model_pair.is_none() && usable.is_empty() {
            return Err(VoiceError::NotReady(format!(
                "speaker '{}' is not trained and has no usable samples",
                speaker
            )));
        }

        std::fs::create_dir_all(&self.outputs_dir)
            .map_err(|e| VoiceError::io(format!("creating {}", self.outputs_dir.display()), e))?;
        let output_path = self.output_path(speaker);

        if !self.client.health().await {
            return self.placeholder(text, speaker, &language, output_path);
        }

        let (mode, selection) = match model_pair {
            Some((gpt, sovits)) => {
                let selection = select_references(&usable, TRAINED_AUX_REFERENCES)?;
                self.client.set_gpt_weights(&absolute(&gpt)).await?;
                self.client.set_sovits_weights(&absolute(&sovits)).await?;
                if !self.weights_settle.is_zero() {
                    tokio::time::sleep(self.weights_settle).await;
                }
                (SynthesisMode::Trained, selection)
            }
            None => (
                SynthesisMode::PretrainedReference,
                select_references(&usable, PRETRAINED_AUX_REFERENCES)?,
            ),
        };

        let request = build_request(text, &language, &selection);
        log::info!(
            "Generating for '{}' ({:?}) with reference {}",
            speaker,
            mode,
            request.ref_audio_path
        );
        let audio = self.client.synthesize(&request).await?;
        tokio::fs::write(&output_path, &audio)
            .await
            .map_err(|e| VoiceError::io(format!("writing {}", output_path.display()), e))?;

        Ok(SynthesisResult {
            output_path,
            mode,
            speaker: speaker.to_string(),
            language,
            reference_path: Some(request.ref_audio_path),
            warning: None,
        })
    }

    fn output_path(&self, speaker: &str) -> PathBuf {
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.outputs_dir.join(format!("{}_{}.wav", speaker, &id[..8]))
    }

    fn placeholder(
        &self,
        text: &str,
        speaker: &str,
        language: &str,
        output_path: PathBuf,
    ) -> VoiceResult<SynthesisResult> {
        let seconds = estimate_placeholder_duration(text, language);
        write_silence(&output_path, seconds, PLACEHOLDER_SAMPLE_RATE)?;

        let warning = format!(
            "Inference service unavailable; wrote {:.1}s of silence instead of speech",
            seconds
        );
        log::warn!("{} (speaker '{}')", warning, speaker);

        Ok(SynthesisResult {
            output_path,
            mode: SynthesisMode::Placeholder,
            speaker: speaker.to_string(),
            language: language.to_string(),
            reference_path: None,
            warning: Some(warning),
        })
    }
}

fn trained_pair(speaker: &Speaker) -> Option<(String, String)> {
    if !speaker.trained {
        return None;
    }
    speaker
        .model_pair()
        .map(|(gpt, sovits)| (gpt.to_string(), sovits.to_string()))
}

fn build_request(text: &str, language: &str, selection: &ReferenceSelection) -> TtsRequest {
    let primary = &selection.primary.sample;
    let aux = selection
        .auxiliary_paths()
        .iter()
        .map(|p| absolute(p))
        .collect();
    TtsRequest::new(
        text,
        language,
        absolute(&primary.storage_path),
        primary.transcript.clone().unwrap_or_default(),
    )
    .with_aux_references(aux)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::wav::probe_wav;
    use crate::database::{ModelInfo, NewSample, METHOD_GPT_SOVITS_TRAINED};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};

    #[derive(Default)]
    struct FakeClient {
        down: bool,
        fail_tts: bool,
        calls: Mutex<Vec<String>>,
        requests: Mutex<Vec<TtsRequest>>,
    }

    #[async_trait]
    impl InferenceClient for FakeClient {
        async fn health(&self) -> bool {
            !self.down
        }

        async fn set_gpt_weights(&self, weights_path: &str) -> VoiceResult<()> {
            self.calls.lock().unwrap().push(format!("gpt:{}", weights_path));
            Ok(())
        }

        async fn set_sovits_weights(&self, weights_path: &str) -> VoiceResult<()> {
            self.calls.lock().unwrap().push(format!("sovits:{}", weights_path));
            Ok(())
        }

        async fn synthesize(&self, request: &TtsRequest) -> VoiceResult<Bytes> {
            self.calls.lock().unwrap().push("tts".to_string());
            self.requests.lock().unwrap().push(request.clone());
            if self.fail_tts {
                return Err(VoiceError::InferenceFailed("tts returned 500".to_string()));
            }
            Ok(Bytes::from_static(b"RIFF-audio"))
        }
    }

    struct Fixture {
        dir: TempDir,
        config: AppConfig,
        store: Arc<SpeakerStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let mut config = AppConfig::with_data_dir(dir.path().join("data"));
            config.inference.weights_settle_ms = 0;
            let store = Arc::new(SpeakerStore::open(&config).unwrap());
            Self { dir, config, store }
        }

        fn add(&self, speaker: &str, durations: &[f64]) {
            for (i, &duration) in durations.iter().enumerate() {
                let path = self.dir.path().join(format!("{}_{}.wav", speaker, i));
                std::fs::write(&path, b"RIFF").unwrap();
                self.store
                    .add_sample(
                        speaker,
                        NewSample {
                            storage_path: path.to_string_lossy().into_owned(),
                            original_path: path.to_string_lossy().into_owned(),
                            duration,
                            sample_rate: 32000,
                            transcript: Some(format!("clip {}", i)),
                        },
                    )
                    .unwrap();
            }
        }

        fn train(&self, speaker: &str) -> (String, String) {
            let gpt = self.dir.path().join("alice-e8.ckpt");
            let sovits = self.dir.path().join("alice_e8.pth");
            std::fs::write(&gpt, b"gpt").unwrap();
            std::fs::write(&sovits, b"sovits").unwrap();
            let info = ModelInfo {
                method: METHOD_GPT_SOVITS_TRAINED.to_string(),
                gpt_model_path: gpt.to_string_lossy().into_owned(),
                sovits_model_path: sovits.to_string_lossy().into_owned(),
                exp_dir: String::new(),
                model_dir: String::new(),
                sample_count: 3,
                stage1_epochs: 8,
                stage2_epochs: 8,
                trained_at: "2024-01-01T00:00:00Z".to_string(),
            };
            self.store.mark_trained(speaker, &info).unwrap();
            (info.gpt_model_path, info.sovits_model_path)
        }

        fn dispatcher(&self, client: Arc<FakeClient>) -> SynthesisDispatcher {
            SynthesisDispatcher::new(&self.config, self.store.clone(), client)
        }
    }

    #[test]
    fn test_normalize_language() {
        assert_eq!(normalize_language("zh-cn"), "zh");
        assert_eq!(normalize_language("zh_TW"), "zh");
        assert_eq!(normalize_language("EN-us"), "en");
        assert_eq!(normalize_language("ja"), "ja");
        assert_eq!(normalize_language(""), "zh");
    }

    #[test]
    fn test_placeholder_duration() {
        assert!((estimate_placeholder_duration("你好世界你好", "zh") - 1.8).abs() < 1e-9);
        assert!((estimate_placeholder_duration("one two three four five six seven", "en") - 1.4).abs() < 1e-9);
        assert_eq!(estimate_placeholder_duration("hi", "en"), 1.0);
        assert_eq!(estimate_placeholder_duration(&"字".repeat(500), "ja"), 30.0);
    }

    #[tokio::test]
    async fn test_trained_speaker_swaps_weights() {
        let f = Fixture::new();
        f.add("alice", &[4.0, 6.0, 8.0, 12.0, 5.0]);
        let (gpt, sovits) = f.train("alice");
        let client = Arc::new(FakeClient::default());

        let result = f
            .dispatcher(client.clone())
            .generate("你好", "alice", "zh-CN")
            .await
            .unwrap();

        assert_eq!(result.mode, SynthesisMode::Trained);
        assert_eq!(result.language, "zh");
        assert!(result.warning.is_none());
        assert_eq!(std::fs::read(&result.output_path).unwrap(), b"RIFF-audio");
        let name = result.output_path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("alice_") && name.ends_with(".wav"));
        assert_eq!(name.len(), "alice_".len() + 8 + ".wav".len());

        let calls = client.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![format!("gpt:{}", gpt), format!("sovits:{}", sovits), "tts".to_string()]
        );

        let request = client.requests.lock().unwrap()[0].clone();
        assert!(request.ref_audio_path.ends_with("alice_1.wav"));
        assert_eq!(request.prompt_text, "clip 1");
        assert_eq!(request.aux_ref_audio_paths.len(), 3);
    }

    #[tokio::test]
    async fn test_untrained_speaker_uses_pretrained_reference() {
        let f = Fixture::new();
        f.add("bob", &[4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 9.5]);
        let client = Arc::new(FakeClient::default());

        let result = f
            .dispatcher(client.clone())
            .generate("hello there", "bob", "en")
            .await
            .unwrap();

        assert_eq!(result.mode, SynthesisMode::PretrainedReference);
        let calls = client.calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["tts".to_string()]);
        let request = client.requests.lock().unwrap()[0].clone();
        assert_eq!(request.aux_ref_audio_paths.len(), 5);
        assert!(Path::new(&request.ref_audio_path).is_absolute());
    }

    #[tokio::test]
    async fn test_unreachable_service_writes_placeholder() {
        let f = Fixture::new();
        f.add("alice", &[5.0]);
        let client = Arc::new(FakeClient {
            down: true,
            ..FakeClient::default()
        });

        let result = f
            .dispatcher(client.clone())
            .generate("你好世界你好", "alice", "zh")
            .await
            .unwrap();

        assert_eq!(result.mode, SynthesisMode::Placeholder);
        assert!(result.warning.is_some());
        assert!(client.calls.lock().unwrap().is_empty());

        let info = probe_wav(&result.output_path).unwrap();
        assert_eq!(info.sample_rate, PLACEHOLDER_SAMPLE_RATE);
        assert!((info.duration - 1.8).abs() < 1e-3);
    }

    #[tokio::test]
    async fn test_speaker_without_usable_samples_is_not_ready() {
        let f = Fixture::new();
        f.add("alice", &[5.0]);
        let sample = f.store.get("alice").unwrap().samples[0].storage_path.clone();
        std::fs::remove_file(sample).unwrap();

        let err = f
            .dispatcher(Arc::new(FakeClient::default()))
            .generate("hello", "alice", "en")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_ready");
    }

    #[tokio::test]
    async fn test_unknown_speaker_and_empty_text() {
        let f = Fixture::new();
        let dispatcher = f.dispatcher(Arc::new(FakeClient::default()));

        let err = dispatcher.generate("hello", "nobody", "en").await.unwrap_err();
        assert_eq!(err.kind(), "not_found");

        f.add("alice", &[5.0]);
        let err = dispatcher.generate("  ", "alice", "en").await.unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[tokio::test]
    async fn test_no_eligible_reference() {
        let f = Fixture::new();
        f.add("alice", &[1.0, 15.0]);

        let err = f
            .dispatcher(Arc::new(FakeClient::default()))
            .generate("hello", "alice", "en")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            VoiceError::NoEligibleReference {
                durations: vec![1.0, 15.0]
            }
        );
    }

    #[tokio::test]
    async fn test_inference_failure_propagates() {
        let f = Fixture::new();
        f.add("alice", &[5.0]);
        let client = Arc::new(FakeClient {
            fail_tts: true,
            ..FakeClient::default()
        });

        let err = f
            .dispatcher(client)
            .generate("hello", "alice", "en")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "inference_failed");
        let outputs: Vec<_> = std::fs::read_dir(f.config.outputs_dir()).unwrap().collect();
        assert!(outputs.is_empty());
    }
}
