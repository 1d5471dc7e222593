use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::ScopeResolutionError;

/// External service that turns a job and placement into a scope symbol id.
///
/// Arguments are the serialized job configuration and parallel configuration.
pub trait ScopeResolver: Send + Sync {
    fn make_scope_symbol(
        &self,
        job_conf: &str,
        parallel_conf: &str,
        is_mirrored: bool,
    ) -> Result<i64, ScopeResolutionError>;
}

/// In-process resolver handing out increasing ids, one per distinct request.
#[derive(Debug)]
pub struct SequentialScopeResolver {
    first_id: i64,
    symbols: Mutex<HashMap<(String, String, bool), i64>>,
}

impl SequentialScopeResolver {
    pub fn new(first_id: i64) -> Self {
        Self {
            first_id,
            symbols: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Entries are inserted whole, so a panic elsewhere never leaves the table half-written.
    fn table(&self) -> MutexGuard<'_, HashMap<(String, String, bool), i64>> {
        self.symbols.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SequentialScopeResolver {
    fn default() -> Self {
        Self::new(1)
    }
}

impl ScopeResolver for SequentialScopeResolver {
    fn make_scope_symbol(
        &self,
        job_conf: &str,
        parallel_conf: &str,
        is_mirrored: bool,
    ) -> Result<i64, ScopeResolutionError> {
        let mut symbols = self.table();
        let next = self.first_id + symbols.len() as i64;
        let id = *symbols
            .entry((job_conf.to_string(), parallel_conf.to_string(), is_mirrored))
            .or_insert(next);
        Ok(id)
    }
}
