//! Audit artifacts written next to a run.

use crate::applicant::Applicant;
use crate::error::ArtifactError;
use crate::outcome::Outcome;

use log::debug;
use serde::Serialize;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

const SUMMARY_FILE: &str = "successfully-registered.csv";

/// Summary row; headers match the roster input so the file can be fed back.
#[derive(Serialize)]
struct SummaryRow<'a> {
    #[serde(rename = "Nume Pasaport")]
    surname: &'a str,
    #[serde(rename = "Prenume Pasaport")]
    given_name: &'a str,
    #[serde(rename = "Data nasterii")]
    birth_date: String,
    #[serde(rename = "Locul naşterii")]
    birthplace: &'a str,
    #[serde(rename = "Prenume Mama")]
    mother_name: &'a str,
    #[serde(rename = "Prenume Tata")]
    father_name: &'a str,
    #[serde(rename = "Adresa de email")]
    email: &'a str,
    #[serde(rename = "Serie și număr Pașaport")]
    passport_number: &'a str,
    #[serde(rename = "Status")]
    status: &'a str,
}

/// Writes per-applicant response pages and the run summary into one directory.
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    dir: PathBuf,
}

impl ArtifactWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn ensure_dir(&self) -> Result<(), ArtifactError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| ArtifactError::Io {
                path: self.dir.clone(),
                source,
            })
    }

    /// Save the raw page of a terminal outcome as
    /// `success-GIVEN_SURNAME.html` or `already-GIVEN_SURNAME.html`.
    pub async fn write_response(
        &self,
        applicant: &Applicant,
        outcome: Outcome,
        body: &str,
    ) -> Result<PathBuf, ArtifactError> {
        let prefix = match outcome {
            Outcome::Success => "success",
            Outcome::AlreadyRegistered => "already",
            other => return Err(ArtifactError::Io {
                path: self.dir.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("no artifact for {} outcome", other),
                ),
            }),
        };
        self.ensure_dir().await?;

        let path = self.dir.join(format!("{}-{}.html", prefix, applicant.file_stem()));
        tokio::fs::write(&path, body)
            .await
            .map_err(|source| ArtifactError::Io {
                path: path.clone(),
                source,
            })?;
        debug!("Saved response for {} to {}", applicant.display_name(), path.display());
        Ok(path)
    }

    /// Append terminal applicants to the summary CSV, writing the header only
    /// when the file is new. The file is written on the blocking pool.
    pub async fn write_summary(&self, rows: Vec<(Applicant, String)>) -> Result<PathBuf, ArtifactError> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || append_summary(&dir, &rows))
            .await
            .map_err(|e| ArtifactError::Io {
                path: self.dir.join(SUMMARY_FILE),
                source: std::io::Error::other(e),
            })?
    }
}

fn append_summary(dir: &Path, rows: &[(Applicant, String)]) -> Result<PathBuf, ArtifactError> {
    std::fs::create_dir_all(dir).map_err(|source| ArtifactError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let path = dir.join(SUMMARY_FILE);
    let exists = path.exists();

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|source| ArtifactError::Io {
            path: path.clone(),
            source,
        })?;
    let mut writer = csv::WriterBuilder::new().has_headers(!exists).from_writer(file);

    for (applicant, status) in rows {
        writer.serialize(SummaryRow {
            surname: &applicant.surname,
            given_name: &applicant.given_name,
            birth_date: applicant.birth_date.format("%Y-%m-%d").to_string(),
            birthplace: &applicant.birthplace,
            mother_name: &applicant.mother_name,
            father_name: &applicant.father_name,
            email: &applicant.email,
            passport_number: &applicant.passport_number,
            status: status.as_str(),
        })?;
    }
    writer.flush().map_err(|source| ArtifactError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}
