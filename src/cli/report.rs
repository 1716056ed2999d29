use std::{net::SocketAddr, path::Path};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::{
    cli::client::DaemonClient,
    daemon::storage::{file_store::FileStore, KeyValueStore, SETTINGS_KEY, TIMER_STATS_KEY},
    protocol::DomainTimeMap,
    utils::{
        percentage::ratio_percentage,
        time::{format_duration, seconds_to_duration},
    },
};

/// Goals the user configured. The tracker never looks at these, the cli owns them
/// entirely. Field names match the persisted json layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProductivityGoals {
    pub daily_goal: String,
    pub limit_website: String,
    /// Minutes, kept as entered. Non-numeric input just disables the limit readout.
    pub website_time_limit: String,
}

/// Focus timer stats written by external timer UIs. Read-only from our side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimerStats {
    pub sessions_completed: u64,
}

const TOP_SITES_LIMIT: usize = 5;

/// Prints every tracked domain with its accumulated time, most used first.
pub async fn process_sites_command(listen: SocketAddr) -> Result<()> {
    let mut client = DaemonClient::connect(listen).await?;
    let site_time = client.site_time().await?;

    if site_time.is_empty() {
        println!("No browsing time tracked yet");
        return Ok(());
    }

    for (domain, seconds) in sorted_site_times(&site_time) {
        println!("{}\t{}", format_duration(seconds_to_duration(seconds)), domain);
    }
    Ok(())
}

/// Prints the productivity summary: score, totals, top sites and goal progress. Site
/// time comes live from the daemon, goals and timer stats are read from storage.
pub async fn process_analytics_command(listen: SocketAddr, dir: &Path) -> Result<()> {
    let mut client = DaemonClient::connect(listen).await?;
    let site_time = client.site_time().await?;

    let store = FileStore::new(dir.join("store"))?;
    let goals = read_goals(&store).await?;
    let timer_stats = read_timer_stats(&store).await?;

    let limit_website = (!goals.limit_website.is_empty()).then_some(goals.limit_website.as_str());

    println!(
        "Productivity score: {}%",
        productivity_score(&site_time, limit_website)
    );
    println!(
        "Total browsing time: {}",
        format_duration(seconds_to_duration(total_seconds(&site_time)))
    );
    println!("Focus sessions completed: {}", timer_stats.sessions_completed);

    let top = top_sites(&site_time, TOP_SITES_LIMIT);
    if !top.is_empty() {
        println!("Top sites:");
        for (domain, seconds) in top {
            println!("  {}\t{}", format_duration(seconds_to_duration(seconds)), domain);
        }
    }

    if goals.daily_goal.is_empty() {
        println!("Daily goal: not set");
    } else {
        println!("Daily goal: {}", goals.daily_goal);
    }

    if let Some(limited) = limit_website {
        if let Ok(limit_minutes) = goals.website_time_limit.parse::<f64>() {
            let used_minutes = site_time.get(limited).copied().unwrap_or_default() / 60.;
            println!(
                "Limit for {limited}: {limit_minutes} minutes, used {} ({})",
                format_duration(seconds_to_duration(used_minutes * 60.)),
                ratio_percentage(used_minutes, limit_minutes)
            );
        }
    }
    Ok(())
}

/// Updates passed in through `goals` flags. Absent fields keep their stored value.
#[derive(Debug, Default, clap::Args)]
pub struct GoalUpdates {
    #[arg(long = "daily-goal", help = "Free-form daily goal to show in analytics")]
    pub daily_goal: Option<String>,
    #[arg(long = "limit-website", help = "Domain counted as unproductive, e.g. youtube.com")]
    pub limit_website: Option<String>,
    #[arg(long = "time-limit", help = "Daily limit for the limited website, in minutes")]
    pub time_limit: Option<String>,
}

impl GoalUpdates {
    fn is_empty(&self) -> bool {
        self.daily_goal.is_none() && self.limit_website.is_none() && self.time_limit.is_none()
    }

    fn apply(self, goals: &mut ProductivityGoals) {
        if let Some(daily_goal) = self.daily_goal {
            goals.daily_goal = daily_goal;
        }
        if let Some(limit_website) = self.limit_website {
            goals.limit_website = limit_website;
        }
        if let Some(time_limit) = self.time_limit {
            goals.website_time_limit = time_limit;
        }
    }
}

/// Shows the stored goals, applying any updates first.
pub async fn process_goals_command(dir: &Path, updates: GoalUpdates) -> Result<()> {
    let mut store = FileStore::new(dir.join("store"))?;
    let mut goals = read_goals(&store).await?;

    if !updates.is_empty() {
        updates.apply(&mut goals);
        store
            .set(SETTINGS_KEY, serde_json::to_value(&goals)?)
            .await?;
    }

    println!(
        "Daily goal: {}",
        if goals.daily_goal.is_empty() { "not set" } else { goals.daily_goal.as_str() }
    );
    if goals.limit_website.is_empty() {
        println!("Website limit: not set");
    } else {
        println!(
            "Website limit: {} minutes on {}",
            if goals.website_time_limit.is_empty() { "?" } else { goals.website_time_limit.as_str() },
            goals.limit_website
        );
    }
    Ok(())
}

pub async fn process_reset_command(listen: SocketAddr) -> Result<()> {
    let mut client = DaemonClient::connect(listen).await?;
    let ack = client.reset_stats().await?;
    if ack.success {
        println!("Browsing stats cleared");
    }
    Ok(())
}

async fn read_goals(store: &FileStore) -> Result<ProductivityGoals> {
    Ok(store
        .get(SETTINGS_KEY)
        .await?
        .map(serde_json::from_value)
        .transpose()?
        .unwrap_or_default())
}

async fn read_timer_stats(store: &FileStore) -> Result<TimerStats> {
    Ok(store
        .get(TIMER_STATS_KEY)
        .await?
        .map(serde_json::from_value)
        .transpose()?
        .unwrap_or_default())
}

fn total_seconds(site_time: &DomainTimeMap) -> f64 {
    site_time.values().sum()
}

fn sorted_site_times(site_time: &DomainTimeMap) -> Vec<(String, f64)> {
    let mut entries = site_time
        .iter()
        .map(|(domain, seconds)| (domain.clone(), *seconds))
        .collect::<Vec<_>>();
    entries.sort_by(|a, b| b.1.total_cmp(&a.1));
    entries
}

fn top_sites(site_time: &DomainTimeMap, limit: usize) -> Vec<(String, f64)> {
    let mut entries = sorted_site_times(site_time);
    entries.truncate(limit);
    entries
}

/// Share of browsing time not spent on the limited website, as a whole percentage.
/// No browsing at all counts as a score of 0.
fn productivity_score(site_time: &DomainTimeMap, limit_website: Option<&str>) -> u32 {
    let total = total_seconds(site_time);
    if total == 0. {
        return 0;
    }
    let limited = limit_website
        .and_then(|site| site_time.get(site))
        .copied()
        .unwrap_or_default();
    ((total - limited) / total * 100.).round() as u32
}
