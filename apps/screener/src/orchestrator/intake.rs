//! Turning files in the input directories into submissions.
//!
//! Job descriptions arrive as CSV files (`job_id, job_title, job_description`) and are moved
//! to `processed/` once every row has been submitted. Resumes are single documents whose
//! file stem becomes the candidate id; they stay where they are because the parser reads them.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::models::candidate::NewCandidate;
use crate::models::job::NewJob;

pub const PROCESSED_DIR: &str = "processed";
pub const RESUME_EXTENSIONS: [&str; 3] = ["pdf", "txt", "md"];

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

#[derive(Debug, Deserialize)]
struct JobCsvRow {
    #[serde(default)]
    job_id: Option<String>,
    #[serde(default)]
    job_title: Option<String>,
    #[serde(default)]
    job_description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputFile {
    JobCsv(PathBuf),
    Resume(PathBuf),
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Decides what a path under one of the input directories is, if anything.
pub fn classify(path: &Path, jd_dir: &Path, resume_dir: &Path) -> Option<InputFile> {
    let parent = path.parent()?;
    let ext = extension(path)?;
    if parent == jd_dir && ext == "csv" {
        Some(InputFile::JobCsv(path.to_path_buf()))
    } else if parent == resume_dir && RESUME_EXTENSIONS.contains(&ext.as_str()) {
        Some(InputFile::Resume(path.to_path_buf()))
    } else {
        None
    }
}

/// Maps a file stem to an identifier: ASCII alphanumerics, `-` and `_` are kept, everything
/// else becomes `_`.
pub fn sanitize_id(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub fn candidate_from_path(path: &Path) -> Option<NewCandidate> {
    let stem = path.file_stem()?.to_str()?;
    let candidate_id = sanitize_id(stem);
    if candidate_id.is_empty() {
        return None;
    }
    Some(NewCandidate {
        candidate_id,
        source_ref: path.to_string_lossy().into_owned(),
    })
}

/// Parses job rows from CSV text. Rows without a description are skipped; rows without an id
/// get `<stem>-<row>` with rows counted from 1.
pub fn parse_jobs(stem: &str, reader: impl std::io::Read) -> Result<Vec<NewJob>, csv::Error> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);

    let mut jobs = Vec::new();
    for (index, row) in csv_reader.deserialize::<JobCsvRow>().enumerate() {
        let row = row?;
        let row_number = index + 1;
        let job_id = row
            .job_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("{}-{row_number}", sanitize_id(stem)));

        let Some(raw_text) = row.job_description.filter(|d| !d.is_empty()) else {
            warn!("Empty job description for job_id {job_id} (row {row_number}); skipping");
            continue;
        };
        jobs.push(NewJob {
            job_id,
            title: row.job_title.unwrap_or_default(),
            raw_text,
        });
    }
    Ok(jobs)
}

pub fn read_job_file(path: &Path) -> Result<Vec<NewJob>, IntakeError> {
    let file = std::fs::File::open(path).map_err(|source| IntakeError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("jobs");
    parse_jobs(stem, file).map_err(|source| IntakeError::Csv {
        path: path.to_path_buf(),
        source,
    })
}

/// Moves a fully submitted job file into the `processed/` directory next to it.
pub fn move_to_processed(path: &Path) -> Result<PathBuf, IntakeError> {
    let io_err = |source| IntakeError::Io {
        path: path.to_path_buf(),
        source,
    };
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let processed = parent.join(PROCESSED_DIR);
    std::fs::create_dir_all(&processed).map_err(io_err)?;

    let file_name = path.file_name().unwrap_or_default();
    let target = processed.join(file_name);
    std::fs::rename(path, &target).map_err(io_err)?;
    info!("Moved processed file to {}", target.display());
    Ok(target)
}

/// Existing input files in both directories, jobs first, each group in name order.
pub fn scan(jd_dir: &Path, resume_dir: &Path) -> Result<Vec<InputFile>, IntakeError> {
    let mut found = Vec::new();
    for dir in [jd_dir, resume_dir] {
        let entries = std::fs::read_dir(dir).map_err(|source| IntakeError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        paths.sort();
        found.extend(
            paths
                .iter()
                .filter_map(|p| classify(p, jd_dir, resume_dir)),
        );
    }
    Ok(found)
}
