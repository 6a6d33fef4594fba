// src/collection.rs
//! Streaming grouping of a sorted flat identity list into a
//! project/type/method tree.
//!
//! Single forward scan with three cursors and three accumulator maps;
//! O(n) time, O(depth) extra state. Input must already be sorted by
//! (project, type, method); out-of-order input fails fast instead of
//! silently producing duplicate groups.

use std::collections::HashMap;

use thiserror::Error;

use crate::model::TestCaseIdentity;

#[derive(Debug, Error)]
#[error("test identity list is out of order at index {index} ({project}/{type_name}/{method})")]
pub struct OutOfOrderError {
    pub index: usize,
    pub project: String,
    pub type_name: String,
    pub method: String,
}

#[derive(Debug, Clone, Default)]
pub struct TestCollection {
    pub all_tests: Vec<TestCaseIdentity>,
    pub projects: HashMap<String, TestProject>,
}

#[derive(Debug, Clone)]
pub struct TestProject {
    pub name: String,
    pub types: HashMap<String, TestType>,
}

#[derive(Debug, Clone)]
pub struct TestType {
    pub name: String,
    pub methods: HashMap<String, TestMethod>,
}

#[derive(Debug, Clone)]
pub struct TestMethod {
    pub name: String,
    /// Cases keyed by argument hash; parameterless cases key on "".
    /// A repeated hash within one method overwrites the prior entry.
    pub cases: HashMap<String, TestCaseIdentity>,
}

impl TestCollection {
    /// Group a pre-sorted identity list into the three-level tree.
    pub fn build(cases: Vec<TestCaseIdentity>) -> Result<TestCollection, OutOfOrderError> {
        let mut state = BuilderState::default();
        let mut last: Option<(String, String, String)> = None;

        for (index, case) in cases.iter().enumerate() {
            let key = (
                case.project.as_str(),
                case.type_name.as_str(),
                case.method.as_str(),
            );
            if let Some(prev) = &last {
                if key < (prev.0.as_str(), prev.1.as_str(), prev.2.as_str()) {
                    return Err(OutOfOrderError {
                        index,
                        project: case.project.clone(),
                        type_name: case.type_name.clone(),
                        method: case.method.clone(),
                    });
                }
            }

            if state.current_project.as_deref() != Some(key.0) {
                state.complete_method();
                state.complete_type();
                state.complete_project();
            } else if state.current_type.as_deref() != Some(key.1) {
                state.complete_method();
                state.complete_type();
            } else if state.current_method.as_deref() != Some(key.2) {
                state.complete_method();
            }

            state.current_project = Some(case.project.clone());
            state.current_type = Some(case.type_name.clone());
            state.current_method = Some(case.method.clone());

            state
                .cases
                .insert(case.argument_hash.clone().unwrap_or_default(), case.clone());

            last = Some((key.0.to_string(), key.1.to_string(), key.2.to_string()));
        }

        state.complete_method();
        state.complete_type();
        state.complete_project();

        Ok(TestCollection {
            all_tests: cases,
            projects: state.projects,
        })
    }

    /// Walk the tree back into a flat list of case identities.
    pub fn flatten(&self) -> Vec<&TestCaseIdentity> {
        self.projects
            .values()
            .flat_map(|p| p.types.values())
            .flat_map(|t| t.methods.values())
            .flat_map(|m| m.cases.values())
            .collect()
    }
}

#[derive(Default)]
struct BuilderState {
    projects: HashMap<String, TestProject>,
    types: HashMap<String, TestType>,
    methods: HashMap<String, TestMethod>,
    cases: HashMap<String, TestCaseIdentity>,
    current_project: Option<String>,
    current_type: Option<String>,
    current_method: Option<String>,
}

impl BuilderState {
    // Flushes are no-ops on empty accumulators so input boundaries never
    // produce empty nodes.

    fn complete_method(&mut self) {
        let Some(name) = self.current_method.take() else {
            return;
        };
        if self.cases.is_empty() {
            return;
        }
        let cases = std::mem::take(&mut self.cases);
        self.methods.insert(name.clone(), TestMethod { name, cases });
    }

    fn complete_type(&mut self) {
        let Some(name) = self.current_type.take() else {
            return;
        };
        if self.methods.is_empty() {
            return;
        }
        let methods = std::mem::take(&mut self.methods);
        self.types.insert(name.clone(), TestType { name, methods });
    }

    fn complete_project(&mut self) {
        let Some(name) = self.current_project.take() else {
            return;
        };
        if self.types.is_empty() {
            return;
        }
        let types = std::mem::take(&mut self.types);
        self.projects.insert(name.clone(), TestProject { name, types });
    }
}
