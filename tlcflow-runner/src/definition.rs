//! Static pipeline graph: a linear chain of named operators.

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;

use crate::operator::Operator;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("pipeline id must not be empty")]
    EmptyId,

    #[error("pipeline '{0}' has no tasks")]
    NoTasks(String),

    #[error("task id must not be empty")]
    EmptyTaskId,

    #[error("duplicate task id '{0}'")]
    DuplicateTask(String),
}

/// A named chain `t0 -> t1 -> ... -> tn`. Each task has at most one upstream
/// and one downstream neighbour.
pub struct PipelineDefinition {
    dag_id: String,
    description: String,
    tags: Vec<String>,
    tasks: Vec<Arc<dyn Operator>>,
}

pub struct ChainBuilder {
    dag_id: String,
    description: String,
    tags: Vec<String>,
    tasks: Vec<Arc<dyn Operator>>,
}

impl ChainBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Append a task after the current tail of the chain.
    pub fn then(mut self, task: Arc<dyn Operator>) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn build(self) -> Result<PipelineDefinition, DefinitionError> {
        if self.dag_id.trim().is_empty() {
            return Err(DefinitionError::EmptyId);
        }
        if self.tasks.is_empty() {
            return Err(DefinitionError::NoTasks(self.dag_id));
        }
        let mut seen = HashSet::new();
        for task in &self.tasks {
            let id = task.task_id();
            if id.trim().is_empty() {
                return Err(DefinitionError::EmptyTaskId);
            }
            if !seen.insert(id.to_string()) {
                return Err(DefinitionError::DuplicateTask(id.to_string()));
            }
        }
        Ok(PipelineDefinition {
            dag_id: self.dag_id,
            description: self.description,
            tags: self.tags,
            tasks: self.tasks,
        })
    }
}

impl PipelineDefinition {
    pub fn chain(dag_id: impl Into<String>) -> ChainBuilder {
        ChainBuilder {
            dag_id: dag_id.into(),
            description: String::new(),
            tags: Vec::new(),
            tasks: Vec::new(),
        }
    }

    pub fn dag_id(&self) -> &str {
        &self.dag_id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Tasks in execution order.
    pub fn tasks(&self) -> &[Arc<dyn Operator>] {
        &self.tasks
    }

    pub fn task_ids(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.task_id()).collect()
    }

    fn position(&self, task_id: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.task_id() == task_id)
    }

    pub fn upstream(&self, task_id: &str) -> Option<&str> {
        let idx = self.position(task_id)?;
        idx.checked_sub(1).map(|i| self.tasks[i].task_id())
    }

    pub fn downstream(&self, task_id: &str) -> Option<&str> {
        let idx = self.position(task_id)?;
        self.tasks.get(idx + 1).map(|t| t.task_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::EmptyOperator;

    fn op(id: &str) -> Arc<dyn Operator> {
        Arc::new(EmptyOperator::new(id))
    }

    #[test]
    fn chain_order_and_neighbours() {
        let def = PipelineDefinition::chain("dag")
            .then(op("start"))
            .then(op("download"))
            .then(op("load"))
            .then(op("end"))
            .build()
            .unwrap();

        assert_eq!(def.task_ids(), vec!["start", "download", "load", "end"]);
        assert_eq!(def.upstream("start"), None);
        assert_eq!(def.upstream("load"), Some("download"));
        assert_eq!(def.downstream("load"), Some("end"));
        assert_eq!(def.downstream("end"), None);
        assert_eq!(def.upstream("missing"), None);
    }

    #[test]
    fn rejects_duplicates_and_empties() {
        let dup = PipelineDefinition::chain("dag")
            .then(op("a"))
            .then(op("a"))
            .build();
        assert_eq!(dup.err(), Some(DefinitionError::DuplicateTask("a".into())));

        assert_eq!(
            PipelineDefinition::chain("dag").build().err(),
            Some(DefinitionError::NoTasks("dag".into()))
        );
        assert_eq!(
            PipelineDefinition::chain(" ").then(op("a")).build().err(),
            Some(DefinitionError::EmptyId)
        );
        assert_eq!(
            PipelineDefinition::chain("dag").then(op("")).build().err(),
            Some(DefinitionError::EmptyTaskId)
        );
    }
}
