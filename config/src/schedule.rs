//! Maintenance schedule settings.
//!
//! fibril does not run a scheduler itself. `fibril schedule` prints the
//! maintenance commands with cron expressions so a host scheduler can install them.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::ConfigError;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub process_clean: ProcessCleanSchedule,
    pub process_optimize: ProcessOptimizeSchedule,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            process_clean: ProcessCleanSchedule::default(),
            process_optimize: ProcessOptimizeSchedule::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessCleanSchedule {
    pub enabled: bool,
    pub frequency: String,
    /// Also sweep expired payload files.
    pub payloads: bool,
}

impl Default for ProcessCleanSchedule {
    fn default() -> Self {
        Self {
            enabled: true,
            frequency: "hourly".to_string(),
            payloads: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessOptimizeSchedule {
    pub enabled: bool,
    pub frequency: String,
}

impl Default for ProcessOptimizeSchedule {
    fn default() -> Self {
        Self {
            enabled: false,
            frequency: "weekly".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frequency {
    EveryMinute,
    EveryFiveMinutes,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    /// Raw five-field cron expression.
    Cron(String),
}

impl Frequency {
    #[must_use]
    pub fn cron_expression(&self) -> &str {
        match self {
            Frequency::EveryMinute => "* * * * *",
            Frequency::EveryFiveMinutes => "*/5 * * * *",
            Frequency::Hourly => "0 * * * *",
            Frequency::Daily => "0 0 * * *",
            Frequency::Weekly => "0 0 * * 0",
            Frequency::Monthly => "0 0 1 * *",
            Frequency::Cron(expr) => expr,
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.cron_expression())
    }
}

impl FromStr for Frequency {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed {
            "everyMinute" => return Ok(Frequency::EveryMinute),
            "everyFiveMinutes" => return Ok(Frequency::EveryFiveMinutes),
            "hourly" => return Ok(Frequency::Hourly),
            "daily" => return Ok(Frequency::Daily),
            "weekly" => return Ok(Frequency::Weekly),
            "monthly" => return Ok(Frequency::Monthly),
            _ => {}
        }

        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        let valid_field = |field: &&str| {
            field
                .chars()
                .all(|c| c.is_ascii_digit() || matches!(c, '*' | '/' | ',' | '-'))
        };
        if fields.len() == 5 && fields.iter().all(valid_field) {
            Ok(Frequency::Cron(fields.join(" ")))
        } else {
            Err(())
        }
    }
}

/// A maintenance command a host scheduler should run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaintenanceTask {
    pub name: &'static str,
    pub frequency: Frequency,
    /// CLI arguments after the binary name.
    pub args: Vec<String>,
}

impl ScheduleConfig {
    /// Enabled maintenance tasks. Empty when the schedule is disabled.
    pub fn maintenance_tasks(&self) -> Result<Vec<MaintenanceTask>, ConfigError> {
        if !self.enabled {
            return Ok(Vec::new());
        }

        let mut tasks = Vec::new();
        if self.process_clean.enabled {
            let frequency = parse_frequency("process_clean", &self.process_clean.frequency)?;
            let mut args = vec!["clean-stale".to_string()];
            if self.process_clean.payloads {
                args.push("--payloads".to_string());
            }
            tasks.push(MaintenanceTask {
                name: "process_clean",
                frequency,
                args,
            });
        }
        if self.process_optimize.enabled {
            let frequency =
                parse_frequency("process_optimize", &self.process_optimize.frequency)?;
            tasks.push(MaintenanceTask {
                name: "process_optimize",
                frequency,
                args: vec!["optimize".to_string()],
            });
        }
        Ok(tasks)
    }
}

fn parse_frequency(task: &'static str, value: &str) -> Result<Frequency, ConfigError> {
    value.parse().map_err(|()| ConfigError::InvalidFrequency {
        task,
        value: value.to_string(),
    })
}
