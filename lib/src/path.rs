// Copyright 2021-2024 The Dagkv Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Store key paths.
//!
//! A [`KeyPath`] addresses a value (or subtree) in a tree: an ordered
//! sequence of [`Step`]s compared componentwise. The text form joins steps
//! with `/`; the root path is the empty sequence and prints as `/`.

#![expect(missing_docs)]

use std::fmt;
use std::fmt::Display;
use std::slice;

use thiserror::Error;

/// Error returned on constructing a [`Step`] or [`KeyPath`] from invalid
/// input.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[error("Invalid path step {step:?}")]
pub struct InvalidPathStepError {
    /// The rejected input.
    pub step: String,
}

fn is_valid_step_str(value: &str) -> bool {
    !value.is_empty() && !value.contains('/')
}

/// Single name step of a [`KeyPath`].
///
/// A step is a non-empty UTF-8 string that does not contain the `/`
/// separator. Other than that, this can be considered an immutable
/// `String`.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Serialize)]
#[serde(transparent)]
pub struct Step(String);

impl Step {
    /// Wraps `value` as a step, failing on the empty string and on embedded
    /// separators.
    pub fn new(value: impl Into<String>) -> Result<Self, InvalidPathStepError> {
        let value = value.into();
        if is_valid_step_str(&value) {
            Ok(Self(value))
        } else {
            Err(InvalidPathStepError { step: value })
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for Step {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::Deserialize as _;
        let value = String::deserialize(deserializer)?;
        Self::new(value).map_err(serde::de::Error::custom)
    }
}

/// Path addressing a value or subtree, relative to the tree root.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct KeyPath {
    steps: Vec<Step>,
}

impl KeyPath {
    /// The root path, i.e. the empty sequence of steps.
    pub fn root() -> Self {
        Self { steps: vec![] }
    }

    pub fn from_steps(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    /// Parses a `/`-joined text form. `""` and `"/"` both parse as the root
    /// path.
    pub fn parse(value: &str) -> Result<Self, InvalidPathStepError> {
        let trimmed = value.trim_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        let steps = trimmed
            .split('/')
            .map(Step::new)
            .collect::<Result<_, _>>()?;
        Ok(Self { steps })
    }

    pub fn is_root(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> slice::Iter<'_, Step> {
        self.steps.iter()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Splits off the first step, returning it and the remaining path.
    pub fn split_first(&self) -> Option<(&Step, Self)> {
        let (first, rest) = self.steps.split_first()?;
        Some((first, Self { steps: rest.to_vec() }))
    }

    /// Splits off the last step, returning the leading path and the step.
    pub fn split_last(&self) -> Option<(Self, &Step)> {
        let (last, init) = self.steps.split_last()?;
        Some((Self { steps: init.to_vec() }, last))
    }

    /// Returns a new path with `step` appended.
    pub fn join(&self, step: &Step) -> Self {
        let mut steps = self.steps.clone();
        steps.push(step.clone());
        Self { steps }
    }
}

impl Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return write!(f, "/");
        }
        let mut sep = "";
        for step in &self.steps {
            write!(f, "{sep}{step}")?;
            sep = "/";
        }
        Ok(())
    }
}

impl FromIterator<Step> for KeyPath {
    fn from_iter<T: IntoIterator<Item = Step>>(iter: T) -> Self {
        Self {
            steps: iter.into_iter().collect(),
        }
    }
}
