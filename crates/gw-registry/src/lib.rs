//! Capability registry (treated as opaque per the admission pipeline): a
//! static list of known agents and skills, each with a declared tool
//! allowlist. No discovery, loading, or execution semantics live here — this
//! crate only answers "does this name exist, and what can it touch".

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub name: String,
    pub description: String,
    pub declared_tools: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillDescriptor {
    pub name: String,
    pub description: String,
    pub declared_tools: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CapabilityRegistry {
    agents: Vec<AgentDescriptor>,
    skills: Vec<SkillDescriptor>,
}

impl CapabilityRegistry {
    /// Seeds the registry with the built-in capability set. A future loader
    /// could replace this with one read from disk; that loader is outside
    /// this crate's scope.
    pub fn builtin() -> Self {
        Self {
            agents: vec![
                AgentDescriptor {
                    name: "general-purpose".to_string(),
                    description: "Handles open-ended multi-step tasks".to_string(),
                    declared_tools: vec![
                        "Read".to_string(),
                        "Write".to_string(),
                        "Bash".to_string(),
                        "Grep".to_string(),
                        "Glob".to_string(),
                    ],
                },
                AgentDescriptor {
                    name: "code-reviewer".to_string(),
                    description: "Reviews diffs for correctness and style".to_string(),
                    declared_tools: vec!["Read".to_string(), "Grep".to_string(), "Glob".to_string()],
                },
            ],
            skills: vec![
                SkillDescriptor {
                    name: "web-search".to_string(),
                    description: "Looks up information on the open web".to_string(),
                    declared_tools: vec!["Bash".to_string()],
                },
                SkillDescriptor {
                    name: "pdf-extract".to_string(),
                    description: "Extracts text and tables from PDF files".to_string(),
                    declared_tools: vec!["Read".to_string()],
                },
            ],
        }
    }

    pub fn agents(&self) -> &[AgentDescriptor] {
        &self.agents
    }

    pub fn skills(&self) -> &[SkillDescriptor] {
        &self.skills
    }

    pub fn has_agent(&self, name: &str) -> bool {
        self.agents.iter().any(|a| a.name == name)
    }

    pub fn has_skill(&self, name: &str) -> bool {
        self.skills.iter().any(|s| s.name == name)
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_knows_its_own_names() {
        let registry = CapabilityRegistry::builtin();
        assert!(registry.has_agent("general-purpose"));
        assert!(registry.has_skill("web-search"));
        assert!(!registry.has_agent("nonexistent-agent"));
    }
}
