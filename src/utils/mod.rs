use std::path::PathBuf;

use chrono::{Local, NaiveDate};
use which::which;

use crate::errors::{AppError, Result};

/// Finds the first of `candidates` present in PATH.
pub fn find_executable(candidates: &[&str]) -> Result<PathBuf> {
    let mut last_err = None;
    for tool in candidates {
        match which(tool) {
            Ok(path) => return Ok(path),
            Err(e) => last_err = Some(e),
        }
    }
    Err(AppError::ToolNotFound {
        tool: candidates.join(" or "),
        source: last_err.unwrap_or(which::Error::CannotFindBinaryPath),
    })
}

pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

pub fn date_stamp(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}
