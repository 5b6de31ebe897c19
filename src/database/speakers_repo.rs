// Speakers repository
// Handles speaker rows, their ordered audio samples and trained-model records

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::models::{AudioSample, ModelInfo, NewSample, Speaker, SpeakerSummary};
use super::DatabaseManager;

impl DatabaseManager {
    /// Append a sample, creating the speaker on first upload. Returns the new sample count.
    pub fn insert_sample(&self, speaker: &str, sample: &NewSample) -> Result<usize> {
        self.with_connection(|conn| insert_sample_impl(conn, speaker, sample))
    }

    /// Get a live (not tombstoned) speaker with samples and model info
    pub fn get_speaker(&self, name: &str) -> Result<Option<Speaker>> {
        self.with_connection(|conn| get_speaker_impl(conn, name, false))
    }

    /// Get all live speakers, oldest first
    pub fn list_speakers(&self) -> Result<Vec<SpeakerSummary>> {
        self.with_connection(list_speakers_impl)
    }

    /// Record a completed training run. Returns false when the speaker is unknown.
    pub fn mark_speaker_trained(&self, name: &str, info: &ModelInfo) -> Result<bool> {
        self.with_connection(|conn| mark_speaker_trained_impl(conn, name, info))
    }

    /// Attach (or replace) the transcript of one sample
    pub fn set_sample_transcript(&self, name: &str, index: usize, transcript: &str) -> Result<bool> {
        self.with_connection(|conn| set_sample_transcript_impl(conn, name, index, transcript))
    }

    /// Hide a speaker from reads while its files are removed
    pub fn tombstone_speaker(&self, name: &str) -> Result<bool> {
        self.with_connection(|conn| {
            let changed = conn
                .execute(
                    "UPDATE speakers SET deleting = 1 WHERE name = ?1 AND deleting = 0",
                    params![name],
                )
                .context("Failed to tombstone speaker")?;
            Ok(changed > 0)
        })
    }

    /// Remove the speaker row; samples and model info cascade
    pub fn delete_speaker_rows(&self, name: &str) -> Result<bool> {
        self.with_connection(|conn| {
            let changed = conn
                .execute("DELETE FROM speakers WHERE name = ?1", params![name])
                .context("Failed to delete speaker")?;
            Ok(changed > 0)
        })
    }

    /// Speakers left tombstoned by an interrupted delete
    pub fn list_tombstoned_speakers(&self) -> Result<Vec<Speaker>> {
        self.with_connection(|conn| {
            let names: Vec<String> = {
                let mut stmt = conn.prepare("SELECT name FROM speakers WHERE deleting = 1")?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                rows.collect::<std::result::Result<_, _>>()?
            };

            let mut speakers = Vec::with_capacity(names.len());
            for name in names {
                if let Some(speaker) = get_speaker_impl(conn, &name, true)? {
                    speakers.push(speaker);
                }
            }
            Ok(speakers)
        })
    }
}

fn insert_sample_impl(conn: &Connection, speaker: &str, sample: &NewSample) -> Result<usize> {
    let tx = conn
        .unchecked_transaction()
        .context("Failed to begin sample transaction")?;
    let now = chrono::Utc::now().to_rfc3339();

    let deleting: Option<bool> = tx
        .query_row(
            "SELECT deleting FROM speakers WHERE name = ?1",
            params![speaker],
            |row| row.get(0),
        )
        .optional()?;
    if deleting == Some(true) {
        anyhow::bail!("Speaker '{}' is being deleted", speaker);
    }
    if deleting.is_none() {
        tx.execute(
            "INSERT INTO speakers (name, created_at) VALUES (?1, ?2)",
            params![speaker, now],
        )
        .context("Failed to create speaker")?;
    }

    let position: i64 = tx.query_row(
        "SELECT COUNT(*) FROM audio_samples WHERE speaker_name = ?1",
        params![speaker],
        |row| row.get(0),
    )?;

    tx.execute(
        r#"
        INSERT INTO audio_samples (
            speaker_name, position, storage_path, original_path,
            duration, sample_rate, uploaded_at, transcript
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
        params![
            speaker,
            position,
            sample.storage_path,
            sample.original_path,
            sample.duration,
            sample.sample_rate,
            now,
            sample.transcript,
        ],
    )
    .context("Failed to insert audio sample")?;

    tx.commit().context("Failed to commit sample")?;
    Ok(position as usize + 1)
}

fn get_speaker_impl(conn: &Connection, name: &str, include_deleting: bool) -> Result<Option<Speaker>> {
    let row = conn
        .query_row(
            "SELECT name, created_at, trained, trained_at, deleting FROM speakers WHERE name = ?1",
            params![name],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, bool>(4)?,
                ))
            },
        )
        .optional()
        .context("Failed to query speaker")?;

    let Some((name, created_at, trained, trained_at, deleting)) = row else {
        return Ok(None);
    };
    if deleting && !include_deleting {
        return Ok(None);
    }

    let samples = get_samples_impl(conn, &name)?;
    let model_info = get_model_info_impl(conn, &name)?;

    Ok(Some(Speaker {
        name,
        samples,
        trained,
        created_at,
        trained_at,
        model_info,
    }))
}

fn get_samples_impl(conn: &Connection, speaker: &str) -> Result<Vec<AudioSample>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT position, storage_path, original_path, duration, sample_rate, uploaded_at, transcript
        FROM audio_samples
        WHERE speaker_name = ?1
        ORDER BY position ASC
        "#,
    )?;

    let samples = stmt
        .query_map(params![speaker], row_to_sample)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to read audio samples")?;
    Ok(samples)
}

fn row_to_sample(row: &Row) -> rusqlite::Result<AudioSample> {
    Ok(AudioSample {
        index: row.get::<_, i64>(0)? as usize,
        storage_path: row.get(1)?,
        original_path: row.get(2)?,
        duration: row.get(3)?,
        sample_rate: row.get(4)?,
        uploaded_at: row.get(5)?,
        transcript: row.get(6)?,
    })
}

fn get_model_info_impl(conn: &Connection, speaker: &str) -> Result<Option<ModelInfo>> {
    conn.query_row(
        r#"
        SELECT method, gpt_model_path, sovits_model_path, exp_dir, model_dir,
               sample_count, s1_epochs, s2_epochs, trained_at
        FROM model_info
        WHERE speaker_name = ?1
        "#,
        params![speaker],
        |row| {
            Ok(ModelInfo {
                method: row.get(0)?,
                gpt_model_path: row.get(1)?,
                sovits_model_path: row.get(2)?,
                exp_dir: row.get(3)?,
                model_dir: row.get(4)?,
                sample_count: row.get::<_, i64>(5)? as usize,
                stage1_epochs: row.get(6)?,
                stage2_epochs: row.get(7)?,
                trained_at: row.get(8)?,
            })
        },
    )
    .optional()
    .context("Failed to query model info")
}

fn list_speakers_impl(conn: &Connection) -> Result<Vec<SpeakerSummary>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT s.name, s.trained, s.created_at, s.trained_at,
               (SELECT COUNT(*) FROM audio_samples a WHERE a.speaker_name = s.name),
               m.sovits_model_path
        FROM speakers s
        LEFT JOIN model_info m ON m.speaker_name = s.name
        WHERE s.deleting = 0
        ORDER BY s.created_at ASC, s.name ASC
        "#,
    )?;

    let speakers = stmt
        .query_map([], |row| {
            Ok(SpeakerSummary {
                name: row.get(0)?,
                trained: row.get(1)?,
                created_at: row.get(2)?,
                trained_at: row.get(3)?,
                audio_count: row.get::<_, i64>(4)? as usize,
                model_path: row.get(5)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to list speakers")?;
    Ok(speakers)
}

fn mark_speaker_trained_impl(conn: &Connection, name: &str, info: &ModelInfo) -> Result<bool> {
    let tx = conn
        .unchecked_transaction()
        .context("Failed to begin training transaction")?;

    let changed = tx.execute(
        "UPDATE speakers SET trained = 1, trained_at = ?2 WHERE name = ?1 AND deleting = 0",
        params![name, info.trained_at],
    )?;
    if changed == 0 {
        return Ok(false);
    }

    tx.execute(
        r#"
        INSERT OR REPLACE INTO model_info (
            speaker_name, method, gpt_model_path, sovits_model_path, exp_dir, model_dir,
            sample_count, s1_epochs, s2_epochs, trained_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
        params![
            name,
            info.method,
            info.gpt_model_path,
            info.sovits_model_path,
            info.exp_dir,
            info.model_dir,
            info.sample_count as i64,
            info.stage1_epochs,
            info.stage2_epochs,
            info.trained_at,
        ],
    )
    .context("Failed to store model info")?;

    tx.commit().context("Failed to commit training result")?;
    Ok(true)
}

fn set_sample_transcript_impl(
    conn: &Connection,
    name: &str,
    index: usize,
    transcript: &str,
) -> Result<bool> {
    let changed = conn
        .execute(
            "UPDATE audio_samples SET transcript = ?3 WHERE speaker_name = ?1 AND position = ?2",
            params![name, index as i64, transcript],
        )
        .context("Failed to update transcript")?;
    Ok(changed > 0)
}
