// Reduces ball-by-ball deliveries into per-inning batting rows and per-player
// career summaries.
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use clap::ValueEnum;
use tracing::{debug, warn};

use crate::io::{Delivery, Match, MatchId};

/// Size of the recent-form window.
pub const LAST_N_MATCHES: usize = 5;

/// How "most recent" matches are picked for the recent-form window.
///
/// `MatchId` treats a higher match identifier as a later match. That only
/// holds when identifiers were handed out in calendar order, so it is an
/// approximation; `MatchDate` uses the fixture date where one is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum RecencyOrder {
    #[default]
    MatchId,
    MatchDate,
}

/// Runs scored by one batter in one inning.
#[derive(Debug, Clone, PartialEq)]
pub struct BattingInning {
    pub match_id: MatchId,
    pub inning: u32,
    pub batsman: String,
    pub batting_team: String,
    pub bowling_team: String,
    pub venue: String,
    pub total_runs: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BattingCareer {
    pub player: String,
    pub innings: usize,
    pub matches: usize,
    pub total_runs: u32,
    pub balls_faced: u32,
    /// `runs / balls * 100`.
    pub strike_rate: f64,
    /// Display average: runs per match played.
    pub average: f64,
    /// Model feature: mean of the per-inning totals. Not the same thing as
    /// `average` once a player bats more than once in a match.
    pub career_average: f64,
    pub last5_runs: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BowlingCareer {
    pub player: String,
    pub wickets: u32,
    pub runs_conceded: u32,
    pub balls: u32,
    pub overs: f64,
    pub economy: f64,
    pub last5_wickets: u32,
}

/// Everything one aggregation pass produces. Rebuilt wholesale from the
/// source records; nothing in here is updated in place.
#[derive(Debug, Clone, Default)]
pub struct Aggregates {
    pub innings: Vec<BattingInning>,
    pub batting: BTreeMap<String, BattingCareer>,
    /// `None` when the deliveries carry no dismissal information at all.
    pub bowling: Option<BTreeMap<String, BowlingCareer>>,
}

impl Aggregates {
    pub fn batting(&self, player: &str) -> Option<&BattingCareer> {
        self.batting.get(player)
    }

    pub fn bowling(&self, player: &str) -> Option<&BowlingCareer> {
        self.bowling.as_ref().and_then(|b| b.get(player))
    }

    /// Career average for the model input, or `None` for a player with no
    /// recorded innings.
    pub fn career_average(&self, player: &str) -> Option<f64> {
        self.batting(player).map(|c| c.career_average)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct InningKey {
    match_id: MatchId,
    inning: u32,
    batsman: String,
    batting_team: String,
    bowling_team: String,
    venue: String,
}

#[derive(Default)]
struct BattingTally {
    runs: u32,
    balls: u32,
    per_match: BTreeMap<MatchId, u32>,
}

#[derive(Default)]
struct BowlingTally {
    wickets: u32,
    runs: u32,
    balls: u32,
    per_match: BTreeMap<MatchId, u32>,
}

/// `num / den`, or 0 when the denominator is zero.
pub fn safe_ratio(num: f64, den: f64) -> f64 {
    if den > 0.0 {
        num / den
    } else {
        0.0
    }
}

pub fn aggregate(deliveries: &[Delivery], matches: &[Match], recency: RecencyOrder) -> Aggregates {
    let venues: HashMap<MatchId, &str> = matches.iter().map(|m| (m.id, m.venue.as_str())).collect();
    let dates: HashMap<MatchId, NaiveDate> = matches
        .iter()
        .filter_map(|m| m.date.map(|d| (m.id, d)))
        .collect();

    let innings = batting_innings(deliveries, &venues);
    // careers cover exactly the deliveries that made it into the innings table
    let known: Vec<&Delivery> = deliveries
        .iter()
        .filter(|d| venues.contains_key(&d.match_id))
        .collect();
    let rank = |id: MatchId| match recency {
        RecencyOrder::MatchId => (None, id),
        RecencyOrder::MatchDate => (dates.get(&id).copied(), id),
    };

    let batting = batting_careers(&known, &innings, &rank);
    let bowling = if known.iter().any(|d| d.dismissal().is_some()) {
        Some(bowling_careers(&known, &rank))
    } else {
        debug!("no dismissal data in deliveries, bowling stats unavailable");
        None
    };

    Aggregates {
        innings,
        batting,
        bowling,
    }
}

/// Groups deliveries by (match, inning, batter, teams, venue) and sums the
/// runs off the bat. Deliveries whose match has no venue record are dropped.
pub fn batting_innings(deliveries: &[Delivery], venues: &HashMap<MatchId, &str>) -> Vec<BattingInning> {
    let mut groups: BTreeMap<InningKey, u32> = BTreeMap::new();
    let mut unmatched = 0usize;

    for d in deliveries {
        let Some(venue) = venues.get(&d.match_id) else {
            unmatched += 1;
            continue;
        };
        let key = InningKey {
            match_id: d.match_id,
            inning: d.inning,
            batsman: d.batsman.clone(),
            batting_team: d.batting_team.clone(),
            bowling_team: d.bowling_team.clone(),
            venue: venue.to_string(),
        };
        *groups.entry(key).or_insert(0) += d.batsman_runs;
    }

    if unmatched > 0 {
        warn!(unmatched, "deliveries without a match record were left out of the batting table");
    }

    groups
        .into_iter()
        .map(|(k, total_runs)| BattingInning {
            match_id: k.match_id,
            inning: k.inning,
            batsman: k.batsman,
            batting_team: k.batting_team,
            bowling_team: k.bowling_team,
            venue: k.venue,
            total_runs,
        })
        .collect()
}

fn batting_careers<R>(deliveries: &[&Delivery], innings: &[BattingInning], rank: &R) -> BTreeMap<String, BattingCareer>
where
    R: Fn(MatchId) -> (Option<NaiveDate>, MatchId),
{
    let mut tallies: BTreeMap<&str, BattingTally> = BTreeMap::new();
    for d in deliveries {
        let t = tallies.entry(d.batsman.as_str()).or_default();
        t.runs += d.batsman_runs;
        t.balls += 1;
        *t.per_match.entry(d.match_id).or_insert(0) += d.batsman_runs;
    }

    let mut inning_totals: HashMap<&str, (u32, usize)> = HashMap::new();
    for row in innings {
        let e = inning_totals.entry(row.batsman.as_str()).or_insert((0, 0));
        e.0 += row.total_runs;
        e.1 += 1;
    }

    tallies
        .into_iter()
        .map(|(player, t)| {
            let (inning_runs, inning_count) = inning_totals.get(player).copied().unwrap_or((0, 0));
            let matches = t.per_match.len();
            let career = BattingCareer {
                player: player.to_string(),
                innings: inning_count,
                matches,
                total_runs: t.runs,
                balls_faced: t.balls,
                strike_rate: safe_ratio(t.runs as f64, t.balls as f64) * 100.0,
                average: safe_ratio(t.runs as f64, matches as f64),
                career_average: safe_ratio(inning_runs as f64, inning_count as f64),
                last5_runs: sum_most_recent(&t.per_match, rank),
            };
            (player.to_string(), career)
        })
        .collect()
}

fn bowling_careers<R>(deliveries: &[&Delivery], rank: &R) -> BTreeMap<String, BowlingCareer>
where
    R: Fn(MatchId) -> (Option<NaiveDate>, MatchId),
{
    let mut tallies: BTreeMap<&str, BowlingTally> = BTreeMap::new();
    for d in deliveries {
        let t = tallies.entry(d.bowler.as_str()).or_default();
        let wicket = u32::from(d.dismissal().is_some());
        t.wickets += wicket;
        t.runs += d.total_runs;
        t.balls += 1;
        // Matches bowled without taking a wicket still occupy a window slot.
        *t.per_match.entry(d.match_id).or_insert(0) += wicket;
    }

    tallies
        .into_iter()
        .map(|(player, t)| {
            let overs = t.balls as f64 / 6.0;
            let career = BowlingCareer {
                player: player.to_string(),
                wickets: t.wickets,
                runs_conceded: t.runs,
                balls: t.balls,
                overs,
                economy: safe_ratio(t.runs as f64, overs),
                last5_wickets: sum_most_recent(&t.per_match, rank),
            };
            (player.to_string(), career)
        })
        .collect()
}

/// Sums the metric over the `LAST_N_MATCHES` highest-ranked matches. Fewer
/// matches than the window just sum what exists.
fn sum_most_recent<R>(per_match: &BTreeMap<MatchId, u32>, rank: &R) -> u32
where
    R: Fn(MatchId) -> (Option<NaiveDate>, MatchId),
{
    let mut ids: Vec<MatchId> = per_match.keys().copied().collect();
    ids.sort_by_key(|&id| Reverse(rank(id)));
    ids.iter()
        .take(LAST_N_MATCHES)
        .filter_map(|id| per_match.get(id))
        .sum()
}
