// Copyright © 2026 The snapfuzz Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("Failed to capture state: {0}")]
    Capture(#[source] anyhow::Error),
    #[error("Failed to apply state: {0}")]
    Apply(#[source] anyhow::Error),
    #[error("Error serialising state: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("Error deserialising state: {0}")]
    Deserialize(#[source] serde_json::Error),
}

/// Opaque bytes describing everything but guest RAM: vCPU registers,
/// device models and the like. Only the collaborator that produced it
/// knows how to read it back.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NonMemoryState(Vec<u8>);

impl NonMemoryState {
    pub fn new(bytes: Vec<u8>) -> Self {
        NonMemoryState(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }

    /// Create from state that can be serialized
    pub fn new_from_state<T>(state: &T) -> Result<Self, StateError>
    where
        T: Serialize,
    {
        serde_json::to_vec(state)
            .map(NonMemoryState)
            .map_err(StateError::Serialize)
    }

    /// Generate the state data from the saved bytes
    pub fn to_state<'a, T>(&'a self) -> Result<T, StateError>
    where
        T: Deserialize<'a>,
    {
        serde_json::from_slice(&self.0).map_err(StateError::Deserialize)
    }
}

impl From<Vec<u8>> for NonMemoryState {
    fn from(bytes: Vec<u8>) -> Self {
        NonMemoryState(bytes)
    }
}

/// Captures and re-applies the non-memory part of the VM.
///
/// Implemented by the VM owning the vCPUs and devices. Both calls happen
/// while the guest is stopped.
pub trait StateSerializer: Send {
    fn capture_state(&mut self) -> Result<NonMemoryState, StateError>;
    fn apply_state(&mut self, state: &NonMemoryState) -> Result<(), StateError>;
}
