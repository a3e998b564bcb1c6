//! Evaluation environment.
//!
//! An `Env` is a linked stack of frames, each a small `(name, Thunk)` table.
//! Lookups walk outward frame by frame and fall through to an enclosing
//! `with` frame only once every lexical frame has been exhausted, matching
//! the rule that `with` never shadows a lexical binding.

use std::cell::RefCell;
use std::rc::Rc;

use crate::thunk::Thunk;

#[derive(Clone)]
pub struct Env(Rc<Frame>);

struct Frame {
    bindings: RefCell<Vec<(String, Thunk)>>,
    /// A `with EXPR; ...` frame additionally carries the attrset thunk to
    /// fall back into when a name isn't found lexically.
    with_attrs: Option<Thunk>,
    parent: Option<Env>,
}

impl Env {
    pub fn root() -> Self {
        Env(Rc::new(Frame {
            bindings: RefCell::new(Vec::new()),
            with_attrs: None,
            parent: None,
        }))
    }

    /// A child frame with no bindings yet; bindings are pushed after
    /// construction so self-referential thunks (`rec { a = 1; b = a; }`,
    /// `{ a, b ? a }: ...`) can capture this very frame.
    pub fn child(&self) -> Self {
        Env(Rc::new(Frame {
            bindings: RefCell::new(Vec::new()),
            with_attrs: None,
            parent: Some(self.clone()),
        }))
    }

    pub fn child_with(&self, attrs: Thunk) -> Self {
        Env(Rc::new(Frame {
            bindings: RefCell::new(Vec::new()),
            with_attrs: Some(attrs),
            parent: Some(self.clone()),
        }))
    }

    pub fn bind(&self, name: impl Into<String>, value: Thunk) {
        self.0.bindings.borrow_mut().push((name.into(), value));
    }

    /// Lexical-only lookup, used to resolve `with` attrsets against the
    /// names already visible at the point of the `with`.
    pub fn lookup_lexical(&self, name: &str) -> Option<Thunk> {
        for (n, t) in self.0.bindings.borrow().iter().rev() {
            if n == name {
                return Some(t.clone());
            }
        }
        self.0.parent.as_ref().and_then(|p| p.lookup_lexical(name))
    }

    /// Every enclosing `with` attrset, innermost first, collected for the
    /// dynamic fallback pass.
    pub fn with_frames(&self) -> Vec<Thunk> {
        let mut out = Vec::new();
        let mut cur = Some(self.clone());
        while let Some(env) = cur {
            if let Some(attrs) = &env.0.with_attrs {
                out.push(attrs.clone());
            }
            cur = env.0.parent.clone();
        }
        out
    }
}
