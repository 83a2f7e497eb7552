//! Unit tests for environments

use super::*;
use crate::value::Value;

#[test]
fn test_define_and_get() {
    let env = Environment::new();
    env.define("x", Value::I64(1));
    assert_eq!(env.get("x").unwrap(), Value::I64(1));
    assert!(matches!(
        env.get("missing"),
        Err(ValueError::UndefinedVariable(_))
    ));
}

#[test]
fn test_define_overwrites_local() {
    let env = Environment::new();
    env.define("x", Value::I64(1));
    env.define("x", Value::I64(2));
    assert_eq!(env.get("x").unwrap(), Value::I64(2));
}

#[test]
fn test_get_walks_outward() {
    let outer = Environment::new();
    outer.define("x", Value::I64(1));
    let inner = Environment::with_enclosing(outer);
    assert_eq!(inner.get("x").unwrap(), Value::I64(1));
}

#[test]
fn test_assign_mutates_first_owner() {
    let outer = Environment::new();
    outer.define("x", Value::I64(1));
    let inner = Environment::with_enclosing(outer.clone());
    inner.assign("x", Value::I64(5)).unwrap();
    assert_eq!(outer.get("x").unwrap(), Value::I64(5));
    assert!(!inner.has_local("x"));

    assert!(matches!(
        inner.assign("missing", Value::Nil),
        Err(ValueError::UndefinedVariable(_))
    ));
}

#[test]
fn test_shadowing_restores_outer_binding() {
    let outer = Environment::new();
    outer.define("x", Value::I64(1));

    let inner = Environment::with_enclosing(outer.clone());
    inner.define("x", Value::I64(99));
    assert_eq!(inner.get("x").unwrap(), Value::I64(99));

    // Dropping the inner scope leaves the outer binding untouched
    drop(inner);
    assert_eq!(outer.get("x").unwrap(), Value::I64(1));
}

#[test]
fn test_remove() {
    let env = Environment::new();
    env.define("x", Value::I64(1));
    env.remove("x").unwrap();
    assert!(env.get("x").is_err());
    assert!(env.remove("x").is_err());
}

#[test]
fn test_snapshot_is_a_copy() {
    let env = Environment::new();
    env.define("x", Value::I64(1));
    let snapshot = env.snapshot();
    env.define("x", Value::I64(2));
    assert_eq!(snapshot.get("x"), Some(&Value::I64(1)));
}

#[test]
fn test_concurrent_access() {
    use std::thread;

    let env = Environment::new();
    env.define("seen", Value::I64(0));

    let mut handles = Vec::new();
    for i in 0..8 {
        let env = env.clone();
        handles.push(thread::spawn(move || {
            for j in 0..100 {
                env.define(format!("t{}_{}", i, j), Value::I64(j));
            }
            env.get("seen").unwrap()
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(env.snapshot().len(), 8 * 100 + 1);
}
