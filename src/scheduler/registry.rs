//! Task class registry: named work classes and their exclusion policies.
//!
//! Every piece of agent work runs under a *task class* (a human-readable
//! name interned to a small integer id) and an *instance key*. The registry
//! owns the name→id mapping and the per-class exclusion policy.
//!
//! # Exclusion semantics
//!
//! A policy is declared one-sided (`db::DBTable` excludes `KSync`) but is
//! enforced symmetrically: two classes conflict if *either* side lists the
//! other. The effective matrix is the symmetric closure of the declared
//! policies and is rebuilt on every policy change.
//!
//! # Invariants
//!
//! - Class ids are dense and never reused; `ClassId(n)` indexes registry
//!   vectors directly.
//! - A class's policy is frozen once the first task of that class has been
//!   submitted. Changing a sealed policy is an invariant violation
//!   (process-fatal): the running exclusion state would be unsound.
//! - A class never excludes itself; intra-class concurrency is governed by
//!   instance keys, not exclusion.

use std::fmt;

use ahash::AHashMap;

/// Interned task class identifier.
///
/// Only valid for the registry that produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

impl ClassId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Errors from policy installation.
#[derive(Debug)]
#[non_exhaustive]
pub enum PolicyError {
    /// The class already has running or queued tasks; its policy is frozen.
    ClassSealed { class: String },
    /// A class listed itself in its own exclusion set.
    SelfExclusion { class: String },
}

impl fmt::Display for PolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClassSealed { class } => {
                write!(f, "policy change on sealed class {class:?}")
            }
            Self::SelfExclusion { class } => {
                write!(f, "class {class:?} excludes itself")
            }
        }
    }
}

impl std::error::Error for PolicyError {}

struct ClassDef {
    name: String,
    /// Declared (one-sided) exclusions.
    declared: Vec<ClassId>,
    /// Frozen once a task of this class has been submitted.
    sealed: bool,
}

/// Registry of task classes and the effective exclusion matrix.
///
/// Not internally synchronized; the scheduler wraps it in its own state
/// lock.
pub struct ClassRegistry {
    classes: Vec<ClassDef>,
    by_name: AHashMap<String, ClassId>,
    /// `effective[a]` holds every class id that may not run while `a` runs
    /// (symmetric closure of declared policies), sorted ascending.
    effective: Vec<Vec<ClassId>>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self {
            classes: Vec::new(),
            by_name: AHashMap::new(),
            effective: Vec::new(),
        }
    }

    /// Interns `name`, creating the class with an empty policy on first use.
    pub fn class_id(&mut self, name: &str) -> ClassId {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let id = ClassId(self.classes.len() as u32);
        self.classes.push(ClassDef {
            name: name.to_string(),
            declared: Vec::new(),
            sealed: false,
        });
        self.effective.push(Vec::new());
        self.by_name.insert(name.to_string(), id);
        id
    }

    /// Looks up an already-interned class.
    pub fn find(&self, name: &str) -> Option<ClassId> {
        self.by_name.get(name).copied()
    }

    pub fn name(&self, id: ClassId) -> &str {
        &self.classes[id.index()].name
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Installs the declared exclusion set for `class`, replacing any prior
    /// declaration, and rebuilds the effective matrix.
    pub fn set_policy(&mut self, class: ClassId, excludes: &[ClassId]) -> Result<(), PolicyError> {
        if self.classes[class.index()].sealed {
            return Err(PolicyError::ClassSealed {
                class: self.classes[class.index()].name.clone(),
            });
        }
        if excludes.contains(&class) {
            return Err(PolicyError::SelfExclusion {
                class: self.classes[class.index()].name.clone(),
            });
        }
        self.classes[class.index()].declared = excludes.to_vec();
        self.rebuild_effective();
        Ok(())
    }

    /// Marks a class as having live work; its policy can no longer change.
    pub fn seal(&mut self, class: ClassId) {
        self.classes[class.index()].sealed = true;
    }

    /// Effective (symmetric) exclusion set for `class`.
    pub fn excludes(&self, class: ClassId) -> &[ClassId] {
        &self.effective[class.index()]
    }

    /// True when `a` and `b` may not run concurrently.
    pub fn conflicts(&self, a: ClassId, b: ClassId) -> bool {
        self.effective[a.index()].binary_search(&b).is_ok()
    }

    fn rebuild_effective(&mut self) {
        let n = self.classes.len();
        let mut eff: Vec<Vec<ClassId>> = vec![Vec::new(); n];
        for (i, def) in self.classes.iter().enumerate() {
            for &other in &def.declared {
                let a = ClassId(i as u32);
                if !eff[a.index()].contains(&other) {
                    eff[a.index()].push(other);
                }
                if !eff[other.index()].contains(&a) {
                    eff[other.index()].push(a);
                }
            }
        }
        for set in &mut eff {
            set.sort_unstable();
        }
        self.effective = eff;
    }
}

impl Default for ClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}
