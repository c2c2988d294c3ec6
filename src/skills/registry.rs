use tracing::{info, warn};

use super::{Skill, ToolDefinition};

/// Skills the server can dispatch to, in registration order.
///
/// The registry does not authorize anything: the access gate decides
/// before a lookup ever happens.
#[derive(Default)]
pub struct SkillRegistry {
    skills: Vec<Box<dyn Skill>>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self { skills: Vec::new() }
    }

    /// Adds a skill, replacing any earlier skill with the same name.
    pub fn register(&mut self, skill: Box<dyn Skill>) {
        let capabilities = skill.capabilities();
        info!(
            "Registered skill: {} (capabilities: {})",
            skill.name(),
            if capabilities.is_empty() {
                "none".to_string()
            } else {
                capabilities.join(", ")
            }
        );
        if let Some(pos) = self.skills.iter().position(|s| s.name() == skill.name()) {
            warn!("Skill {} registered twice, replacing", skill.name());
            self.skills[pos] = skill;
        } else {
            self.skills.push(skill);
        }
    }

    pub fn get(&self, name: &str) -> Option<&dyn Skill> {
        self.skills
            .iter()
            .find(|s| s.name() == name)
            .map(|s| s.as_ref())
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.skills
            .iter()
            .map(|s| ToolDefinition {
                name: s.name().to_string(),
                description: s.description().to_string(),
                input_schema: s.parameters_schema(),
            })
            .collect()
    }
}
