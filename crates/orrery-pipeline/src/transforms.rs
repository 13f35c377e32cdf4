//! Graph transform passes applied between validation and execution.

use orrery_types::Result;

use crate::graph::PipelineGraph;
use crate::stylesheet::{apply_stylesheet, parse_stylesheet};

/// A named rewrite of the graph before execution.
pub trait GraphTransform: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, graph: &mut PipelineGraph) -> Result<()>;
}

/// Expands `$goal` in node prompts and labels.
pub struct VariableExpansion;

impl GraphTransform for VariableExpansion {
    fn name(&self) -> &str {
        "variable_expansion"
    }

    fn apply(&self, graph: &mut PipelineGraph) -> Result<()> {
        let goal = graph.goal.clone();
        for node in graph.all_nodes_mut() {
            if let Some(prompt) = &node.prompt {
                if prompt.contains("$goal") {
                    node.prompt = Some(prompt.replace("$goal", &goal));
                }
            }
            if node.label.contains("$goal") {
                node.label = node.label.replace("$goal", &goal);
            }
        }
        Ok(())
    }
}

/// Parses `graph.model_stylesheet` and applies it to every node.
pub struct StylesheetApplication;

impl GraphTransform for StylesheetApplication {
    fn name(&self) -> &str {
        "stylesheet_application"
    }

    fn apply(&self, graph: &mut PipelineGraph) -> Result<()> {
        let Some(source) = graph.model_stylesheet.clone() else {
            return Ok(());
        };
        let sheet = parse_stylesheet(&source)?;
        apply_stylesheet(graph, &sheet);
        Ok(())
    }
}

/// Run transforms in order.
pub fn apply_transforms(
    graph: &mut PipelineGraph,
    transforms: &[Box<dyn GraphTransform>],
) -> Result<()> {
    for transform in transforms {
        tracing::debug!(transform = transform.name(), "applying graph transform");
        transform.apply(graph)?;
    }
    Ok(())
}

/// The standard transform pipeline.
pub fn default_transforms() -> Vec<Box<dyn GraphTransform>> {
    vec![Box::new(VariableExpansion), Box::new(StylesheetApplication)]
}
