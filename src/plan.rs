//! Build plans: an initial instruction plus ordered steps.
//!
//! Plans are immutable once constructed. They can be built directly, parsed
//! from numbered text (`1. Do the thing`), or loaded from a TOML file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::{clog_debug, Error, Result};

const DEFAULT_PLAN_NAME: &str = "Multi-Agent Task";

/// One unit of work within a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Position of the step in its plan, stable for the plan's life.
    pub id: usize,
    /// Step number as written by the author (1-based in text plans).
    pub number: u32,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration: Option<Duration>,
}

impl Step {
    pub fn new(id: usize, content: impl Into<String>) -> Self {
        Self {
            id,
            number: id as u32 + 1,
            content: content.into(),
            description: None,
            estimated_duration: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub name: String,
    pub initial_instruction: String,
    pub steps: Vec<Step>,
}

impl Plan {
    /// Build a plan, re-numbering step ids to their sequence position.
    ///
    /// A plan with no steps and a blank instruction is rejected, as is any
    /// step with blank content.
    pub fn new(initial_instruction: impl Into<String>, steps: Vec<Step>) -> Result<Self> {
        let initial_instruction = initial_instruction.into();
        if steps.is_empty() && initial_instruction.trim().is_empty() {
            return Err(Error::Construction(
                "plan has neither an initial instruction nor any steps".to_string(),
            ));
        }
        let steps = steps
            .into_iter()
            .enumerate()
            .map(|(id, step)| {
                if step.content.trim().is_empty() {
                    return Err(Error::Construction(format!(
                        "step {} has empty content",
                        step.number
                    )));
                }
                Ok(Step { id, ..step })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            name: DEFAULT_PLAN_NAME.to_string(),
            initial_instruction,
            steps,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Build a plan from a prompt and a plain list of step texts.
    pub fn from_prompt(prompt: &str, steps: &[String]) -> Result<Self> {
        let steps = steps
            .iter()
            .enumerate()
            .map(|(i, s)| Step::new(i, s.clone()))
            .collect();
        Self::new(prompt, steps)
    }

    /// Load a plan file; `.toml` files are parsed as TOML, anything else as text.
    pub fn load(path: &Path) -> Result<Self> {
        clog_debug!("Plan::load path={}", path.display());
        let content = fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::parse_toml(&content),
            _ => Self::parse_text(&content),
        }
    }

    /// Parse the numbered-list text format.
    ///
    /// Lines before the first `N. ` line form the initial instruction; every
    /// later `N. content` line becomes a step. Other lines after the first
    /// step are ignored.
    pub fn parse_text(content: &str) -> Result<Self> {
        let lines: Vec<&str> = content.trim().lines().collect();
        let first_step = lines.iter().position(|l| parse_numbered(l).is_some());

        let instruction_lines = match first_step {
            Some(idx) => &lines[..idx],
            None => &lines[..],
        };
        let instruction = instruction_lines.join("\n").trim().to_string();

        let steps = first_step
            .map(|idx| {
                lines[idx..]
                    .iter()
                    .filter_map(|l| parse_numbered(l))
                    .enumerate()
                    .map(|(id, (number, text))| Step {
                        number,
                        ..Step::new(id, text)
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self::new(instruction, steps)
    }

    pub fn parse_toml(content: &str) -> Result<Self> {
        let file: PlanFile = toml::from_str(content)?;
        let steps = file
            .steps
            .into_iter()
            .enumerate()
            .map(|(id, entry)| match entry {
                StepEntry::Text(text) => Ok(Step::new(id, text)),
                StepEntry::Detailed {
                    content,
                    description,
                    estimated_minutes,
                } => Ok(Step {
                    description,
                    estimated_duration: estimated_minutes.map(minutes).transpose()?,
                    ..Step::new(id, content)
                }),
            })
            .collect::<Result<Vec<_>>>()?;
        let plan = Self::new(file.initial_instruction, steps)?;
        Ok(match file.name {
            Some(name) => plan.with_name(name),
            None => plan,
        })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct PlanFile {
    name: Option<String>,
    #[serde(default)]
    initial_instruction: String,
    #[serde(default)]
    steps: Vec<StepEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StepEntry {
    Text(String),
    Detailed {
        content: String,
        description: Option<String>,
        estimated_minutes: Option<u64>,
    },
}

fn minutes(m: u64) -> Result<Duration> {
    m.checked_mul(60)
        .map(Duration::from_secs)
        .ok_or_else(|| Error::Construction(format!("estimated_minutes {} is out of range", m)))
}

/// Split `12. Write tests` into `(12, "Write tests")`.
fn parse_numbered(line: &str) -> Option<(u32, String)> {
    let trimmed = line.trim();
    let (number, rest) = trimmed.split_once(". ")?;
    if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some((number.parse().ok()?, rest.trim().to_string()))
}
