//! Embedding extraction through an external program.
//!
//! The program is run with the image path as its last argument and must
//! print the embedding as JSON on stdout: a bare array of numbers, an
//! object with an `embedding` array, or a list of such objects (the first
//! face is used). Exit code 3 means no face was found.

use rollcall_core::{Embedding, EmbeddingExtractor, ExtractionError};
use serde::Deserialize;
use std::path::Path;
use std::process::{Command, Stdio};

/// Exit status reserved for "no face in the image".
pub const NO_FACE_EXIT_CODE: i32 = 3;

#[derive(Deserialize)]
struct FaceEntry {
    embedding: Vec<f64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ExtractorOutput {
    Vector(Vec<f64>),
    Face(FaceEntry),
    Faces(Vec<FaceEntry>),
}

pub struct CommandExtractor {
    program: String,
    args: Vec<String>,
}

impl CommandExtractor {
    /// Build from `[program, args...]`. Returns `None` for an empty command.
    pub fn from_command(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl EmbeddingExtractor for CommandExtractor {
    fn extract(&mut self, image: &Path) -> Result<Embedding, ExtractionError> {
        if !image.is_file() {
            return Err(ExtractionError::Failed(format!("image not found: {}", image.display())));
        }

        let started = std::time::Instant::now();
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(image)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| ExtractionError::Failed(format!("failed to run {}: {e}", self.program)))?;

        tracing::debug!(
            program = %self.program,
            image = %image.display(),
            status = ?output.status.code(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "extractor finished"
        );

        match output.status.code() {
            Some(0) => parse_output(&output.stdout, image),
            Some(NO_FACE_EXIT_CODE) => Err(ExtractionError::NoFaceDetected(image.display().to_string())),
            code => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(ExtractionError::Failed(format!(
                    "{} exited with {}: {}",
                    self.program,
                    code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
                    stderr.trim()
                )))
            }
        }
    }
}

fn parse_output(stdout: &[u8], image: &Path) -> Result<Embedding, ExtractionError> {
    let parsed: ExtractorOutput = serde_json::from_slice(stdout)
        .map_err(|e| ExtractionError::Failed(format!("unreadable extractor output: {e}")))?;

    let values = match parsed {
        ExtractorOutput::Vector(values) => values,
        ExtractorOutput::Face(face) => face.embedding,
        ExtractorOutput::Faces(faces) => match faces.into_iter().next() {
            Some(face) => face.embedding,
            None => Vec::new(),
        },
    };

    if values.is_empty() {
        return Err(ExtractionError::NoFaceDetected(image.display().to_string()));
    }
    Ok(Embedding::new(values))
}
