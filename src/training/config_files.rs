//! Trainer configuration files
//!
//! Stage 1 reads a YAML config, stage 2 a JSON config. Both are produced by
//! loading the toolkit's template and overwriting the keys that point at this
//! run's experiment directory and hyperparameters.

use std::path::Path;

use crate::error::{VoiceError, VoiceResult};

/// Stage-1 (text-to-semantic) run parameters
#[derive(Debug, Clone)]
pub struct Stage1Settings<'a> {
    pub speaker: &'a str,
    pub epochs: u32,
    pub batch_size: u32,
    pub save_every: u32,
    pub pretrained: &'a Path,
    pub semantic_table: &'a Path,
    pub phoneme_table: &'a Path,
    pub output_dir: &'a Path,
}

/// Stage-2 (timbre) run parameters
#[derive(Debug, Clone)]
pub struct Stage2Settings<'a> {
    pub speaker: &'a str,
    pub epochs: u32,
    pub batch_size: u32,
    pub save_every: u32,
    pub gpu_numbers: &'a str,
    pub pretrained_generator: &'a Path,
    pub pretrained_discriminator: &'a Path,
    pub exp_dir: &'a Path,
    pub phoneme_table: &'a Path,
    pub wav_dir: &'a Path,
    pub output_dir: &'a Path,
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn read_template(path: &Path) -> VoiceResult<String> {
    std::fs::read_to_string(path).map_err(|e| {
        VoiceError::PreconditionError(format!(
            "config template {} is unreadable: {}",
            path.display(),
            e
        ))
    })
}

/// Set a dotted key inside a YAML document, creating mappings on the way
pub fn set_yaml(root: &mut serde_yaml::Value, key: &str, value: serde_yaml::Value) {
    let mut node = root;
    let mut parts = key.split('.').peekable();
    while let Some(part) = parts.next() {
        if !node.is_mapping() {
            *node = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());
        }
        let map = match node.as_mapping_mut() {
            Some(map) => map,
            None => return,
        };
        let k = serde_yaml::Value::String(part.to_string());
        if parts.peek().is_none() {
            map.insert(k, value);
            return;
        }
        node = map
            .entry(k)
            .or_insert_with(|| serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
    }
}

/// Set a dotted key inside a JSON document, creating objects on the way
pub fn set_json(root: &mut serde_json::Value, key: &str, value: serde_json::Value) {
    let mut node = root;
    let mut parts = key.split('.').peekable();
    while let Some(part) = parts.next() {
        if !node.is_object() {
            *node = serde_json::Value::Object(serde_json::Map::new());
        }
        let map = match node.as_object_mut() {
            Some(map) => map,
            None => return,
        };
        if parts.peek().is_none() {
            map.insert(part.to_string(), value);
            return;
        }
        node = map
            .entry(part.to_string())
            .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
    }
}

/// Render the stage-1 YAML config from its template
pub fn write_stage1_config(
    template: &Path,
    output: &Path,
    settings: &Stage1Settings<'_>,
) -> VoiceResult<()> {
    let raw = read_template(template)?;
    let mut config: serde_yaml::Value = serde_yaml::from_str(&raw).map_err(|e| {
        VoiceError::PreconditionError(format!("invalid YAML in {}: {}", template.display(), e))
    })?;

    let out_dir = path_str(settings.output_dir);
    set_yaml(&mut config, "train.epochs", settings.epochs.into());
    set_yaml(&mut config, "train.batch_size", settings.batch_size.into());
    set_yaml(&mut config, "train.save_every_n_epoch", settings.save_every.into());
    set_yaml(&mut config, "train.if_save_latest", true.into());
    set_yaml(&mut config, "train.if_save_every_weights", true.into());
    set_yaml(&mut config, "train.half_weights_save_dir", out_dir.clone().into());
    set_yaml(&mut config, "train.exp_name", settings.speaker.into());
    set_yaml(&mut config, "pretrained_s1", path_str(settings.pretrained).into());
    set_yaml(
        &mut config,
        "train_semantic_path",
        path_str(settings.semantic_table).into(),
    );
    set_yaml(
        &mut config,
        "train_phoneme_path",
        path_str(settings.phoneme_table).into(),
    );
    set_yaml(&mut config, "output_dir", out_dir.into());

    let rendered = serde_yaml::to_string(&config)
        .map_err(|e| VoiceError::Io(format!("serializing stage-1 config: {}", e)))?;
    std::fs::write(output, rendered)
        .map_err(|e| VoiceError::io(format!("writing {}", output.display()), e))
}

/// Render the stage-2 JSON config from its template
pub fn write_stage2_config(
    template: &Path,
    output: &Path,
    settings: &Stage2Settings<'_>,
) -> VoiceResult<()> {
    let raw = read_template(template)?;
    let mut config: serde_json::Value = serde_json::from_str(&raw).map_err(|e| {
        VoiceError::PreconditionError(format!("invalid JSON in {}: {}", template.display(), e))
    })?;

    let table = path_str(settings.phoneme_table);
    let updates = [
        ("train.epochs", serde_json::json!(settings.epochs)),
        ("train.batch_size", serde_json::json!(settings.batch_size)),
        ("train.save_every_epoch", serde_json::json!(settings.save_every)),
        ("train.if_save_latest", serde_json::json!(true)),
        ("train.if_save_every_weights", serde_json::json!(true)),
        ("train.name", serde_json::json!(settings.speaker)),
        ("train.gpu_numbers", serde_json::json!(settings.gpu_numbers)),
        (
            "train.pretrained_s2G",
            serde_json::json!(path_str(settings.pretrained_generator)),
        ),
        (
            "train.pretrained_s2D",
            serde_json::json!(path_str(settings.pretrained_discriminator)),
        ),
        ("name", serde_json::json!(settings.speaker)),
        ("model.version", serde_json::json!("v2")),
        ("save_weight_dir", serde_json::json!(path_str(settings.output_dir))),
        ("data.exp_dir", serde_json::json!(path_str(settings.exp_dir))),
        ("data.training_files", serde_json::json!(table)),
        ("data.validation_files", serde_json::json!(table)),
        ("data.wav_path", serde_json::json!(path_str(settings.wav_dir))),
    ];
    for (key, value) in updates {
        set_json(&mut config, key, value);
    }

    let rendered = serde_json::to_string_pretty(&config)
        .map_err(|e| VoiceError::Io(format!("serializing stage-2 config: {}", e)))?;
    std::fs::write(output, rendered)
        .map_err(|e| VoiceError::io(format!("writing {}", output.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::tempdir;

    #[test]
    fn test_set_yaml_creates_nested_keys() {
        let mut doc: serde_yaml::Value = serde_yaml::from_str("train:\n  epochs: 20\n").unwrap();
        set_yaml(&mut doc, "train.epochs", 8u32.into());
        set_yaml(&mut doc, "data.max_sec", 54u32.into());
        assert_eq!(doc["train"]["epochs"].as_u64(), Some(8));
        assert_eq!(doc["data"]["max_sec"].as_u64(), Some(54));
    }

    #[test]
    fn test_stage1_config_points_at_experiment() {
        let dir = tempdir().unwrap();
        let template = dir.path().join("s1longer-v2.yaml");
        std::fs::write(
            &template,
            "train:\n  epochs: 20\n  precision: 16-mixed\nmodel:\n  vocab_size: 1025\n",
        )
        .unwrap();
        let exp = dir.path().join("alice");
        let out = dir.path().join("s1_config.yaml");

        write_stage1_config(
            &template,
            &out,
            &Stage1Settings {
                speaker: "alice",
                epochs: 8,
                batch_size: 4,
                save_every: 5,
                pretrained: &PathBuf::from("/pre/s1.ckpt"),
                semantic_table: &exp.join("6-name2semantic-0.tsv"),
                phoneme_table: &exp.join("2-name2text-0.txt"),
                output_dir: &exp.join("logs_s1"),
            },
        )
        .unwrap();

        let written: serde_yaml::Value =
            serde_yaml::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(written["train"]["epochs"].as_u64(), Some(8));
        assert_eq!(written["train"]["precision"].as_str(), Some("16-mixed"));
        assert_eq!(written["train"]["exp_name"].as_str(), Some("alice"));
        assert_eq!(written["model"]["vocab_size"].as_u64(), Some(1025));
        assert!(written["output_dir"].as_str().unwrap().ends_with("logs_s1"));
    }

    #[test]
    fn test_stage2_config_points_at_experiment() {
        let dir = tempdir().unwrap();
        let template = dir.path().join("s2.json");
        std::fs::write(
            &template,
            r#"{"train": {"epochs": 100, "seed": 1234}, "data": {"sampling_rate": 32000}, "model": {}}"#,
        )
        .unwrap();
        let exp = dir.path().join("alice");
        let out = dir.path().join("s2_config.json");

        write_stage2_config(
            &template,
            &out,
            &Stage2Settings {
                speaker: "alice",
                epochs: 8,
                batch_size: 4,
                save_every: 4,
                gpu_numbers: "0",
                pretrained_generator: &PathBuf::from("/pre/s2G.pth"),
                pretrained_discriminator: &PathBuf::from("/pre/s2D.pth"),
                exp_dir: &exp,
                phoneme_table: &exp.join("2-name2text.txt"),
                wav_dir: &exp.join("5-wav32k"),
                output_dir: &exp.join("logs_s2_v2"),
            },
        )
        .unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(written["train"]["epochs"], 8);
        assert_eq!(written["train"]["seed"], 1234);
        assert_eq!(written["data"]["sampling_rate"], 32000);
        assert_eq!(written["model"]["version"], "v2");
        assert_eq!(written["name"], "alice");
        assert!(written["data"]["training_files"]
            .as_str()
            .unwrap()
            .ends_with("2-name2text.txt"));
    }

    #[test]
    fn test_missing_template_is_precondition() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        let err = write_stage2_config(
            &missing,
            &dir.path().join("out.json"),
            &Stage2Settings {
                speaker: "a",
                epochs: 1,
                batch_size: 1,
                save_every: 1,
                gpu_numbers: "0",
                pretrained_generator: dir.path(),
                pretrained_discriminator: dir.path(),
                exp_dir: dir.path(),
                phoneme_table: dir.path(),
                wav_dir: dir.path(),
                output_dir: dir.path(),
            },
        )
        .unwrap_err();
        assert_eq!(err.kind(), "precondition_error");
    }
}
