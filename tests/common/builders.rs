//! Test data builders for creating test objects

use explorer_engine::engine::{InstructionsSource, StaticInstructions};
use explorer_engine::{ExplorerConfig, Instruction};
use serde_json::Value;
use std::sync::Arc;

/// Builder for creating test Instructions
pub struct InstructionBuilder {
    instruction: Instruction,
}

impl InstructionBuilder {
    pub fn new(run: &str, name: &str) -> Self {
        Self {
            instruction: Instruction::new(run, name),
        }
    }

    pub fn context(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.instruction = self.instruction.with_context(key, value);
        self
    }

    pub fn param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.instruction = self.instruction.with_param(key, value);
        self
    }

    pub fn steps(mut self, start: u64, end: u64) -> Self {
        self.instruction = self.instruction.with_steps(start, end);
        self
    }

    pub fn blob(mut self, blob: &str) -> Self {
        self.instruction = self.instruction.with_blob(blob);
        self
    }

    pub fn build(self) -> Instruction {
        self.instruction
    }
}

/// `loss` and `accuracy` for train/val on each of `runs` runs
pub fn metric_grid(runs: usize) -> Vec<Instruction> {
    let mut items = Vec::new();
    for run in 0..runs {
        for name in ["loss", "accuracy"] {
            for subset in ["train", "val"] {
                items.push(
                    InstructionBuilder::new(&format!("run-{}", run), name)
                        .context("subset", subset)
                        .param("lr", 0.001 * (run + 1) as f64)
                        .steps(0, 100 * (run as u64 + 1))
                        .build(),
                );
            }
        }
    }
    items
}

pub fn static_source(items: Vec<Instruction>) -> Arc<dyn InstructionsSource> {
    Arc::new(StaticInstructions::new(items))
}

/// Config with `color` and `row` grouping slots, persistence off
pub fn explorer_config(name: &str) -> ExplorerConfig {
    let mut config = ExplorerConfig {
        name: name.to_string(),
        ..ExplorerConfig::default()
    };
    config.groupings.insert("color".to_string(), Default::default());
    config.groupings.insert("row".to_string(), Default::default());
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instruction_builder() {
        let instruction = InstructionBuilder::new("r1", "loss")
            .context("subset", "val")
            .steps(0, 10)
            .build();

        assert_eq!(instruction.name, "loss");
        assert_eq!(instruction.run.hash, "r1");
        assert_eq!(instruction.context["subset"], "val");
    }
}
