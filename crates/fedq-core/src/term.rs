//! RDF terms and variables.
//!
//! Values are `oxrdf` terms; an unbound cell is `None`. The constructors here
//! are shorthands used by sources and tests.

pub use oxrdf::{BlankNode, Literal, NamedNode, Term, Variable};

pub fn iri(value: impl Into<String>) -> Term {
    NamedNode::new_unchecked(value).into()
}

pub fn lit(value: impl Into<String>) -> Term {
    Literal::new_simple_literal(value).into()
}

pub fn int(value: i64) -> Term {
    Literal::from(value).into()
}

pub fn var(name: impl Into<String>) -> Variable {
    Variable::new_unchecked(name)
}
