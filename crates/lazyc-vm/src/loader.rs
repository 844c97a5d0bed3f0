//! Hydration context
//!
//! A [`Loader`] owns the per-object state for one container: it hands out
//! one [`CodeObject`] per code-table index and drives batch hydration. The
//! container is shared (`Arc`) so several loaders, one per thread, can read
//! the same bytes.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use lazyc_bytecode::{BytecodeError, CodeIndex, Container, Table};
use rustc_hash::FxHashMap;

use crate::code::CodeObject;
use crate::config::LoaderConfig;
use crate::error::{VmError, VmResult};
use crate::hydration::HydrationLevel;
use crate::interpreter::Interpreter;

pub(crate) struct LoaderInner {
    container: Arc<Container>,
    config: LoaderConfig,
    /// Handles by code index, kept for the loader's lifetime so hydration
    /// levels never go back
    codes: RefCell<FxHashMap<u32, Rc<CodeObject>>>,
}

impl LoaderInner {
    pub(crate) fn container(&self) -> &Arc<Container> {
        &self.container
    }

    pub(crate) fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// The handle for `index`, creating a dehydrated one on first use
    pub(crate) fn code_object(self: &Rc<Self>, index: u32) -> VmResult<Rc<CodeObject>> {
        if let Some(code) = self.codes.borrow().get(&index) {
            return Ok(Rc::clone(code));
        }
        if self.container.code_offset(CodeIndex(index))?.is_none() {
            return Err(BytecodeError::Absent {
                table: Table::Code,
                index,
            }
            .into());
        }
        let code = Rc::new(CodeObject::new(index, Rc::downgrade(self)));
        self.codes.borrow_mut().insert(index, Rc::clone(&code));
        Ok(code)
    }
}

/// Outcome of [`Loader::hydrate_all`]
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Objects that reached the requested level
    pub hydrated: Vec<Rc<CodeObject>>,
    /// Objects that failed, by code index
    pub failures: Vec<(u32, VmError)>,
}

impl BatchReport {
    /// Whether every object succeeded
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Hydration context over one container
#[derive(Clone)]
pub struct Loader {
    inner: Rc<LoaderInner>,
}

impl Loader {
    /// Open `bytes` as a container with the default configuration
    pub fn open(bytes: impl Into<Vec<u8>>) -> VmResult<Self> {
        let container = Container::open(bytes)?;
        Ok(Self::new(Arc::new(container)))
    }

    /// Create a loader with the default configuration
    pub fn new(container: Arc<Container>) -> Self {
        Self::with_config(container, LoaderConfig::default())
    }

    /// Create a loader with a custom configuration
    pub fn with_config(container: Arc<Container>, config: LoaderConfig) -> Self {
        Self {
            inner: Rc::new(LoaderInner {
                container,
                config,
                codes: RefCell::new(FxHashMap::default()),
            }),
        }
    }

    /// The shared container
    pub fn container(&self) -> &Arc<Container> {
        &self.inner.container
    }

    /// The configuration
    pub fn config(&self) -> &LoaderConfig {
        &self.inner.config
    }

    /// Number of entries in the code table, slot 0 included
    pub fn code_count(&self) -> u32 {
        self.inner.container.counts().code
    }

    /// Get the handle for code object `index`.
    ///
    /// Repeated calls return the same handle for as long as the loader
    /// lives, so hydration done through one handle is seen by all. A handle
    /// that outlives its loader can no longer hydrate unless it was compiled.
    pub fn code_object(&self, index: u32) -> VmResult<Rc<CodeObject>> {
        self.inner.code_object(index)
    }

    /// A construction engine using this loader's limits
    pub fn interpreter(&self) -> Interpreter {
        Interpreter::with_config(self.inner.config.clone())
    }

    /// Bring every present code object to `level`.
    ///
    /// A failing object is recorded and skipped; the rest of the batch
    /// continues.
    pub fn hydrate_all(&self, level: HydrationLevel) -> BatchReport {
        let mut report = BatchReport::default();
        for index in 1..self.code_count() {
            match self.inner.container.code_offset(CodeIndex(index)) {
                Ok(Some(_)) => {}
                Ok(None) => continue,
                Err(e) => {
                    report.failures.push((index, e.into()));
                    continue;
                }
            }
            let result = self
                .code_object(index)
                .and_then(|code| code.hydrate_to(level).map(|()| code));
            match result {
                Ok(code) => report.hydrated.push(code),
                Err(e) => {
                    tracing::warn!(
                        target: "lazyc::hydrate",
                        code = index,
                        level = %level,
                        error = %e,
                        "code object failed to hydrate"
                    );
                    report.failures.push((index, e));
                }
            }
        }
        tracing::debug!(
            target: "lazyc::hydrate",
            hydrated = report.hydrated.len(),
            failed = report.failures.len(),
            level = %level,
            "batch hydration finished"
        );
        report
    }
}

impl std::fmt::Debug for Loader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loader")
            .field("stats", &self.inner.container.stats())
            .field("config", &self.inner.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lazyc_bytecode::{CodeSpec, ContainerBuilder};

    fn two_objects() -> Loader {
        let mut builder = ContainerBuilder::new();
        builder.add_code_spec(&CodeSpec::new("a")).unwrap();
        builder.add_code_spec(&CodeSpec::new("b")).unwrap();
        Loader::open(builder.finish().unwrap()).unwrap()
    }

    #[test]
    fn test_handles_are_shared() {
        let loader = two_objects();
        let a = loader.code_object(1).unwrap();
        let again = loader.code_object(1).unwrap();
        assert!(Rc::ptr_eq(&a, &again));
        assert_eq!(loader.code_count(), 3);
    }

    #[test]
    fn test_absent_and_bad_indices() {
        let loader = two_objects();
        let absent = loader.code_object(0).unwrap_err();
        assert_eq!(absent.kind(), crate::ErrorKind::Absent);
        let bad = loader.code_object(7).unwrap_err();
        assert_eq!(bad.kind(), crate::ErrorKind::BadIndex);
    }

    #[test]
    fn test_hydrate_all() {
        let loader = two_objects();
        let report = loader.hydrate_all(HydrationLevel::FullyHydrated);
        assert!(report.is_clean());
        assert_eq!(report.hydrated.len(), 2);
        assert!(
            report
                .hydrated
                .iter()
                .all(|c| c.level() == HydrationLevel::FullyHydrated)
        );
    }

    #[test]
    fn test_levels_survive_dropped_handles() {
        let loader = two_objects();
        let report = loader.hydrate_all(HydrationLevel::FullyHydrated);
        assert!(report.is_clean());
        drop(report);

        for index in 1..loader.code_count() {
            let code = loader.code_object(index).unwrap();
            assert_eq!(code.level(), HydrationLevel::FullyHydrated);
        }

        let a = loader.code_object(1).unwrap();
        a.hydrate_to(HydrationLevel::PartiallyHydrated).unwrap();
        drop(a);
        assert_eq!(
            loader.code_object(1).unwrap().level(),
            HydrationLevel::FullyHydrated
        );
    }

    #[test]
    fn test_handle_outliving_loader_is_detached() {
        let loader = two_objects();
        let a = loader.code_object(1).unwrap();
        assert!(!a.is_detached());
        drop(loader);

        assert!(a.is_detached());
        let err = a.hydrate_to(HydrationLevel::PartiallyHydrated).unwrap_err();
        assert_eq!(err, VmError::Detached);
        assert_eq!(a.level(), HydrationLevel::Dehydrated);
    }
}
