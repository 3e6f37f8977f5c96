//! Built-in agents, observation rules, maintenance tasks and collaboration
//! routing used when the configuration does not override them.

use crate::collaboration::Specialization;
use crate::types::TaskPriority;
use crate::watcher::{AgentTargets, MaintenanceTask, WatchRule};

/// Agents of the content platform.
pub fn default_agents() -> Vec<String> {
    [
        "UIEnchanter",
        "QualityGuardian",
        "ContentAlchemist",
        "PersonaLearner",
        "DataOracle",
        "AstroCalculus",
        "CardWeaver",
        "CommunityShaman",
        "Sophia",
        "Luna",
        "Sol",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Observation rules, in match order.
pub fn default_rules() -> Vec<WatchRule> {
    vec![
        rule(
            "ui_issues",
            &[
                "no visual feedback",
                "hover effect missing",
                "animation not working",
                "slow loading",
                "accessibility issue",
                "mobile responsive",
                "layout broken",
            ],
            AgentTargets::One("UIEnchanter".into()),
            TaskPriority::High,
            "Fix UI issue: {observation}",
        ),
        rule(
            "performance",
            &[
                "performance",
                "slow",
                "timeout",
                "lag",
                "memory leak",
                "cpu usage",
                "bundle size",
            ],
            AgentTargets::One("QualityGuardian".into()),
            TaskPriority::High,
            "Investigate and fix performance issue: {observation}",
        ),
        rule(
            "content_requests",
            &[
                "content needed",
                "daily horoscope",
                "astrological insight",
                "spiritual guidance",
                "tarot reading",
            ],
            AgentTargets::One("ContentAlchemist".into()),
            TaskPriority::Medium,
            "Generate content: {observation}",
        ),
        rule(
            "user_experience",
            &[
                "user confusion",
                "unclear instructions",
                "onboarding",
                "user feedback",
                "usability",
                "user journey",
            ],
            AgentTargets::One("PersonaLearner".into()),
            TaskPriority::Medium,
            "Analyze and improve user experience: {observation}",
        ),
        rule(
            "data_problems",
            &[
                "data missing",
                "database error",
                "sync issue",
                "data integrity",
                "migration needed",
            ],
            AgentTargets::One("DataOracle".into()),
            TaskPriority::High,
            "Resolve data issue: {observation}",
        ),
        rule(
            "astro_calculations",
            &[
                "astronomical",
                "ephemeris",
                "planet position",
                "birth chart",
                "transit",
                "aspect calculation",
            ],
            AgentTargets::One("AstroCalculus".into()),
            TaskPriority::Medium,
            "Handle astronomical calculation: {observation}",
        ),
        rule(
            "tarot_logic",
            &[
                "card selection",
                "shuffle algorithm",
                "spread logic",
                "card meaning",
                "tarot interpretation",
            ],
            AgentTargets::One("CardWeaver".into()),
            TaskPriority::Medium,
            "Improve tarot logic: {observation}",
        ),
        rule(
            "community",
            &[
                "community",
                "social",
                "user interaction",
                "moderation",
                "engagement",
            ],
            AgentTargets::One("CommunityShaman".into()),
            TaskPriority::Low,
            "Address community need: {observation}",
        ),
        rule(
            "spiritual_guidance",
            &[
                "spiritual crisis",
                "guidance needed",
                "healing request",
                "shadow work",
                "emotional support",
            ],
            AgentTargets::Many(vec!["Sophia".into(), "Luna".into(), "Sol".into()]),
            TaskPriority::High,
            "Provide spiritual guidance: {observation}",
        ),
    ]
}

fn rule(
    name: &str,
    patterns: &[&str],
    agents: AgentTargets,
    priority: TaskPriority,
    template: &str,
) -> WatchRule {
    WatchRule {
        name: name.to_string(),
        patterns: patterns.iter().map(ToString::to_string).collect(),
        agents,
        priority,
        template: template.to_string(),
    }
}

/// Periodic self-improvement work, one entry per specialty.
pub fn default_maintenance() -> Vec<MaintenanceTask> {
    let task = |description: &str, agent: &str, priority, tag: &str| MaintenanceTask {
        description: description.to_string(),
        agent: agent.to_string(),
        priority,
        tags: vec!["self_improvement".to_string(), tag.to_string()],
    };
    vec![
        task(
            "Analyze recent user interactions and identify improvement opportunities",
            "PersonaLearner",
            TaskPriority::Low,
            "weekly",
        ),
        task(
            "Review accessibility compliance of current UI components",
            "UIEnchanter",
            TaskPriority::Medium,
            "accessibility",
        ),
        task(
            "Audit spiritual content quality and authenticity",
            "QualityGuardian",
            TaskPriority::Medium,
            "quality",
        ),
        task(
            "Optimize agent collaboration patterns and communication",
            "CommunityShaman",
            TaskPriority::Low,
            "collaboration",
        ),
        task(
            "Update astrological calculation accuracy and data sources",
            "AstroCalculus",
            TaskPriority::Medium,
            "accuracy",
        ),
    ]
}

/// Phrases in agent output that ask for another agent's help.
pub fn default_triggers() -> Vec<String> {
    [
        "need help",
        "require assistance",
        "collaborate with",
        "ask another agent",
        "escalate to",
        "blocked by",
        "unable to complete",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Keyword to helper routing, checked in order.
pub fn default_specializations() -> Vec<Specialization> {
    [
        ("ui", "UIEnchanter"),
        ("interface", "UIEnchanter"),
        ("design", "UIEnchanter"),
        ("data", "DataOracle"),
        ("database", "DataOracle"),
        ("astrology", "AstroCalculus"),
        ("astronomical", "AstroCalculus"),
        ("tarot", "CardWeaver"),
        ("card", "CardWeaver"),
        ("content", "ContentAlchemist"),
        ("writing", "ContentAlchemist"),
        ("user", "PersonaLearner"),
        ("learning", "PersonaLearner"),
        ("community", "CommunityShaman"),
        ("social", "CommunityShaman"),
        ("quality", "QualityGuardian"),
        ("testing", "QualityGuardian"),
        ("spiritual", "Sophia"),
        ("mystical", "Sophia"),
        ("emotional", "Luna"),
        ("healing", "Luna"),
        ("shadow", "Sol"),
        ("transformation", "Sol"),
    ]
    .into_iter()
    .map(|(keyword, agent)| Specialization {
        keyword: keyword.to_string(),
        agent: agent.to_string(),
    })
    .collect()
}
