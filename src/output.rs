use std::io::{self, Write};

use serde::Serialize;

use crate::domain::FeedIdentity;
use crate::harvest::{HarvestSummary, ListResult};

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_summary(summary: &HarvestSummary) -> io::Result<()> {
        Self::print_json(summary)
    }

    pub fn print_identity(identity: &FeedIdentity) -> io::Result<()> {
        Self::print_json(identity)
    }

    pub fn print_list(result: &ListResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout().lock();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}
