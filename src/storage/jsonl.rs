//! JSONL log of finalized consolidation runs, one file per chat

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::config::Config;
use crate::consolidation::ConsolidationRun;
use crate::error::Result;
use crate::types::ChatId;

/// Append-only run log
pub struct RunLog {
    config: Config,
}

impl RunLog {
    pub fn new(config: &Config) -> Result<Self> {
        std::fs::create_dir_all(config.runs_dir())?;
        Ok(Self {
            config: config.clone(),
        })
    }

    fn log_path(&self, chat_id: &str) -> PathBuf {
        self.config.runs_log_path(chat_id)
    }

    /// Append a finalized run
    pub fn append(&self, run: &ConsolidationRun) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(&run.chat_id))?;
        let json = serde_json::to_string(run)?;
        writeln!(file, "{}", json)?;
        Ok(())
    }

    /// Every chat's runs, oldest first, grouped by the chat id written in
    /// each record rather than by file name
    pub fn read_every_chat(&self) -> Result<HashMap<ChatId, Vec<ConsolidationRun>>> {
        let mut chats: HashMap<ChatId, Vec<ConsolidationRun>> = HashMap::new();
        for entry in std::fs::read_dir(self.config.runs_dir())? {
            let path = entry?.path();
            if path.extension().map(|e| e == "jsonl").unwrap_or(false) {
                for run in read_file(&path)? {
                    chats.entry(run.chat_id.clone()).or_default().push(run);
                }
            }
        }
        for runs in chats.values_mut() {
            runs.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        }
        Ok(chats)
    }
}

fn read_file(path: &Path) -> Result<Vec<ConsolidationRun>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(File::open(path)?);
    let mut runs = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        // a torn final line from a crash is skipped, not fatal
        match serde_json::from_str::<ConsolidationRun>(&line) {
            Ok(run) => runs.push(run),
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable run record"),
        }
    }
    Ok(runs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConsolidationTrigger;
    use tempfile::TempDir;

    #[test]
    fn runs_append_and_read_back_in_order() {
        let dir = TempDir::new().unwrap();
        let log = RunLog::new(&Config::with_data_dir(dir.path())).unwrap();

        let first = ConsolidationRun::start("chat/1", ConsolidationTrigger::Manual);
        let second = ConsolidationRun::start("chat/1", ConsolidationTrigger::Scheduled);
        log.append(&first).unwrap();
        log.append(&second).unwrap();

        let every = log.read_every_chat().unwrap();
        assert_eq!(every.len(), 1);
        assert_eq!(every["chat/1"], vec![first, second]);
        assert!(!every.contains_key("other"));
    }

    #[test]
    fn lookalike_chat_ids_keep_separate_histories() {
        let dir = TempDir::new().unwrap();
        let log = RunLog::new(&Config::with_data_dir(dir.path())).unwrap();
        let slash = ConsolidationRun::start("a/b", ConsolidationTrigger::Manual);
        let underscore = ConsolidationRun::start("a_b", ConsolidationTrigger::Manual);
        log.append(&slash).unwrap();
        log.append(&underscore).unwrap();
        assert_ne!(log.log_path("a/b"), log.log_path("a_b"));

        let every = log.read_every_chat().unwrap();
        assert_eq!(every["a/b"], vec![slash]);
        assert_eq!(every["a_b"], vec![underscore]);
    }

    #[test]
    fn records_are_grouped_by_their_own_chat_id() {
        let dir = TempDir::new().unwrap();
        let log = RunLog::new(&Config::with_data_dir(dir.path())).unwrap();
        let own = ConsolidationRun::start("c1", ConsolidationTrigger::Manual);
        let stray = ConsolidationRun::start("c2", ConsolidationTrigger::Manual);
        log.append(&own).unwrap();
        // a record for c2 sitting in c1's file, as older layouts could produce
        let mut file = OpenOptions::new().append(true).open(log.log_path("c1")).unwrap();
        writeln!(file, "{}", serde_json::to_string(&stray).unwrap()).unwrap();

        let every = log.read_every_chat().unwrap();
        assert_eq!(every["c1"], vec![own]);
        assert_eq!(every["c2"], vec![stray]);
    }

    #[test]
    fn torn_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let log = RunLog::new(&Config::with_data_dir(dir.path())).unwrap();
        let run = ConsolidationRun::start("c1", ConsolidationTrigger::Manual);
        log.append(&run).unwrap();
        let mut file = OpenOptions::new().append(true).open(log.log_path("c1")).unwrap();
        write!(file, "{{\"id\":").unwrap();

        assert_eq!(log.read_every_chat().unwrap()["c1"], vec![run]);
    }
}
