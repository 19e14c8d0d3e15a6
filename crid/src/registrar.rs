/* -------------------------------------------------------------------------- *\
 *                |   █████╗ ██╗   ██╗██████╗  █████╗ ███████╗ |              *
 *                |  ██╔══██╗██║   ██║██╔══██╗██╔══██╗██╔════╝ |              *
 *                |  ███████║██║   ██║██████╔╝███████║█████╗   |              *
 *                |  ██╔══██║██║   ██║██╔══██╗██╔══██║██╔══╝   |              *
 *                |  ██║  ██║╚██████╔╝██║  ██║██║  ██║███████╗ |              *
 *                |  ╚═╝  ╚═╝ ╚═════╝ ╚═╝  ╚═╝╚═╝  ╚═╝╚══════╝ |              *
 *                +--------------------------------------------+              *
 *                                                                            *
 *                         Distributed Systems Runtime                        *
 * -------------------------------------------------------------------------- *
 * Copyright 2022 - 2024, the aurae contributors                              *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Unique reservation of human names to machine ids.
//!
//! A sandbox or container name stays reserved for as long as its store
//! entry exists. Failing creation paths release the reservation through
//! their deferred cleanup.

use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistrarError {
    #[error("name \"{name}\" is reserved for \"{id}\"")]
    NameReserved { name: String, id: String },
}

pub type Result<T> = std::result::Result<T, RegistrarError>;

/// The name → id reservation index.
#[derive(Debug, Default)]
pub struct NameIndex {
    names: Mutex<HashMap<String, String>>,
}

impl NameIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves `name` for `id`. Reserving an identical `(name, id)`
    /// pair again is a no-op; any other holder is a conflict.
    pub fn reserve(&self, name: &str, id: &str) -> Result<()> {
        let mut names = self.names.lock().expect("name index lock");
        match names.get(name) {
            Some(holder) if holder == id => Ok(()),
            Some(holder) => Err(RegistrarError::NameReserved {
                name: name.to_string(),
                id: holder.clone(),
            }),
            None => {
                let _ = names.insert(name.to_string(), id.to_string());
                Ok(())
            }
        }
    }

    /// Releases a reservation by name. Unknown names are ignored.
    pub fn release_by_name(&self, name: &str) {
        let mut names = self.names.lock().expect("name index lock");
        let _ = names.remove(name);
    }

    /// Releases every reservation held by `id`. Needed by cleanup paths
    /// that know the id but not which name won the reservation.
    pub fn release_by_key(&self, id: &str) {
        let mut names = self.names.lock().expect("name index lock");
        names.retain(|_, holder| holder != id);
    }

    pub fn get(&self, name: &str) -> Option<String> {
        let names = self.names.lock().expect("name index lock");
        names.get(name).cloned()
    }

    pub fn is_reserved(&self, name: &str) -> bool {
        self.get(name).is_some()
    }
}
