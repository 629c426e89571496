// Module for loading the ball-by-ball and match CSV files. It validates the
// field count per row and skips blank or malformed lines.
use std::fs::File;
use std::path::Path;

use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::warn;

use crate::error::Result;

pub type MatchId = u64;

mod date_format {
    use chrono::NaiveDate;
    use serde::{Deserialize, Deserializer};

    // Season files mix ISO dates with the short day-first form.
    const FORMATS: [&str; 2] = ["%Y-%m-%d", "%d/%m/%y"];

    pub fn deserialize<'de, D>(d: D) -> Result<Option<NaiveDate>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Option::<String>::deserialize(d)?;
        Ok(s.and_then(|raw| {
            let raw = raw.trim().to_string();
            FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(&raw, fmt).ok())
        }))
    }
}

/// One ball bowled.
#[derive(Debug, Clone, Deserialize)]
pub struct Delivery {
    pub match_id: MatchId,
    pub inning: u32,
    pub batting_team: String,
    pub bowling_team: String,
    pub batsman: String,
    pub bowler: String,
    pub batsman_runs: u32,
    pub total_runs: u32,
    #[serde(default)]
    pub player_dismissed: Option<String>,
}

impl Delivery {
    /// The dismissed player, if the row records a non-blank one.
    pub fn dismissal(&self) -> Option<&str> {
        self.player_dismissed
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Match {
    #[serde(rename = "id", alias = "match_id")]
    pub id: MatchId,
    pub venue: String,
    #[serde(default, deserialize_with = "date_format::deserialize")]
    pub date: Option<NaiveDate>,
}

pub fn load_deliveries(path: impl AsRef<Path>) -> Result<Vec<Delivery>> {
    load_csv(path)
}

pub fn load_matches(path: impl AsRef<Path>) -> Result<Vec<Match>> {
    load_csv(path)
}

/// Reads every well-formed row of a headered CSV file into `T`.
pub fn load_csv<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<Vec<T>> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let mut rdr = ReaderBuilder::new()
        .delimiter(b',')
        .flexible(true)
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(file);

    let headers = rdr.headers()?.clone();
    let expected_len = headers.len();

    let mut out = Vec::new();
    for result in rdr.records() {
        let raw: StringRecord = result?;
        let line = raw.position().map(|p| p.line()).unwrap_or(0);

        if raw.iter().all(|f| f.trim().is_empty()) {
            continue;
        }

        if raw.len() != expected_len {
            warn!(
                file = %path.display(),
                line,
                expected = expected_len,
                found = raw.len(),
                "skipping row with wrong field count"
            );
            continue;
        }

        match raw.deserialize::<T>(Some(&headers)) {
            Ok(rec) => out.push(rec),
            Err(e) => {
                warn!(file = %path.display(), line, error = %e, "skipping malformed row");
            }
        }
    }

    Ok(out)
}
