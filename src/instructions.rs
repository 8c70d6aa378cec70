//! Text sent to agents: the initial instruction, step and bundle prompts.

use std::path::PathBuf;

use crate::orchestration::DistributionPolicy;
use crate::plan::{Plan, Step};
use crate::session::SessionId;

/// Where agents read the claim table and drop claim requests.
#[derive(Debug, Clone)]
pub struct ClaimPaths {
    pub table: PathBuf,
    pub requests: PathBuf,
}

/// Initial message for one session. Empty when there is nothing to say.
pub fn initial_message(
    plan: &Plan,
    policy: DistributionPolicy,
    agents: usize,
    claims: &ClaimPaths,
    session: SessionId,
) -> String {
    let mut text = plan.initial_instruction.trim().to_string();

    if agents > 1 {
        push_block(&mut text, &coordination_text(policy, agents, claims, session));
    }
    if policy == DistributionPolicy::Collaborative && !plan.steps.is_empty() {
        push_block(&mut text, &overview_text(&plan.steps));
    }

    if text.is_empty() {
        return text;
    }
    tag(text, session)
}

pub fn step_message(step: &Step) -> String {
    let mut text = format!("Step {}: {}", step.number, step.content);
    if let Some(desc) = &step.description {
        text.push_str(&format!("\n\nDescription: {}", desc));
    }
    text
}

pub fn bundle_message(steps: &[Step]) -> String {
    let mut text = String::from("You have been assigned the following related steps:\n");
    for step in steps {
        text.push_str(&format!("\nStep {}: {}", step.number, step.content));
        if let Some(desc) = &step.description {
            text.push_str(&format!("\n   Description: {}", desc));
        }
    }
    text.push_str("\n\nThese steps are related and should be completed together.");
    text
}

/// Message for one dispatch: pending notices, then the step or bundle.
pub fn dispatch_message(steps: &[Step], notices: &[String], session: SessionId) -> String {
    let mut text = String::new();
    if !notices.is_empty() {
        text.push_str(&notice_block(notices));
        text.push('\n');
    }
    match steps {
        [single] => text.push_str(&step_message(single)),
        many => text.push_str(&bundle_message(many)),
    }
    tag(text, session)
}

/// Notices for a session with no step left to send.
pub fn notice_message(notices: &[String], session: SessionId) -> String {
    let mut text = notice_block(notices);
    text.push_str("\nNo further steps are assigned to you. Finish your current work.");
    tag(text, session)
}

fn notice_block(notices: &[String]) -> String {
    let mut text = String::from("Coordinator notices:\n");
    for notice in notices {
        text.push_str(&format!("- {}\n", notice));
    }
    text
}

fn tag(text: String, session: SessionId) -> String {
    format!("{}\n\n[Session ID: {}]", text, session)
}

fn push_block(text: &mut String, block: &str) {
    if !text.is_empty() {
        text.push_str("\n\n");
    }
    text.push_str(block);
}

fn coordination_text(
    policy: DistributionPolicy,
    agents: usize,
    claims: &ClaimPaths,
    session: SessionId,
) -> String {
    let request_example = format!(
        r#"{{"session": "{}", "action": "acquire", "resource": "path/to/file"}}"#,
        session
    );
    let protocol = format!(
        "Claim protocol:\n\
         1. Read {table} to see which files other agents have claimed\n\
         2. Before modifying a file, claim it by writing a JSON file named\n   \
            <unix-millis>-{short}.json into {requests}/ containing:\n   \
            {example}\n   \
            Write it under another name first and rename it into place\n\
         3. Release it the same way with \"action\": \"release\" when done or if you hit problems\n\
         4. Refused claims are reported in your next message from the coordinator; pick other work",
        table = claims.table.display(),
        short = session.short(),
        requests = claims.requests.display(),
        example = request_example,
    );

    match policy {
        DistributionPolicy::Collaborative => format!(
            "IMPORTANT: You are part of a team of {} AI agents working collaboratively.\n\
             All agents have received the complete list of steps for this project.\n\n\
             Collaboration protocol:\n\
             - Review ALL steps before choosing what to work on\n\
             - Choose work that complements what others have claimed\n\
             - Focus on integration points between components\n\
             - Communicate through descriptive commits and clear interfaces\n\n\
             {}",
            agents, protocol
        ),
        _ => format!(
            "IMPORTANT: You are part of a team of {} AI agents working in parallel.\n\
             You will receive your own steps one message at a time.\n\n\
             {}",
            agents, protocol
        ),
    }
}

fn overview_text(steps: &[Step]) -> String {
    let mut text = String::from("COMPLETE PROJECT STEPS:\n");
    for step in steps {
        text.push_str(&format!("\nStep {}: {}", step.number, step.content));
        if let Some(desc) = &step.description {
            text.push_str(&format!("\n   Description: {}", desc));
        }
    }
    text.push_str(
        "\n\nChoose which step(s) to work on based on what others have already claimed, \
         dependencies between steps and your analysis of the codebase. \
         Claim your files before starting.",
    );
    text
}
