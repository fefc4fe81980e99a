//! Built-in task kinds for the ensemble workflow engine.
//!
//! Composite kinds (serial, parallel, decision, loop, call) orchestrate
//! subtasks; leaf kinds (iterate, wait, terminate, http, func, code) perform
//! a primitive effect. Every kind can be built programmatically through its
//! builder or declaratively by registering the factories into a
//! [`Registry`](ensemble_core::Registry) and constructing from JSON.

pub mod call;
pub mod code;
mod common;
pub mod decision;
pub mod func;
pub mod http;
pub mod iterate;
pub mod loop_;
pub mod parallel;
pub mod serial;
pub mod terminate;
pub mod wait;

pub use call::Call;
pub use code::Code;
pub use decision::Decision;
pub use func::Func;
pub use http::Http;
pub use iterate::Iterate;
pub use loop_::Loop;
pub use parallel::Parallel;
pub use serial::Serial;
pub use terminate::Terminate;
pub use wait::Wait;

use ensemble_core::{ConstructError, Registry};

/// Registers every built-in task factory into the given registry.
pub fn register_builtins(registry: &mut Registry) -> Result<(), ConstructError> {
    serial::register(registry)?;
    parallel::register(registry)?;
    decision::register(registry)?;
    loop_::register(registry)?;
    iterate::register(registry)?;
    call::register(registry)?;
    wait::register(registry)?;
    terminate::register(registry)?;
    http::register(registry)?;
    func::register(registry)?;
    code::register(registry)?;
    Ok(())
}

/// A fresh registry with all built-in task kinds registered.
pub fn registry() -> Registry {
    let mut registry = Registry::new();
    register_builtins(&mut registry).expect("built-in registration");
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensemble_core::{Context, Input, Value};
    use serde_json::Map;

    #[test]
    fn test_workflow_document_constructs_and_executes() {
        tokio_test::block_on(async {
            let registry = registry();
            let flow = registry
                .construct_from_json(
                    r#"{
                        "name": "greeting",
                        "type": "serial",
                        "timeout": "3s",
                        "input": {
                            "tasks": [
                                {
                                    "name": "compute",
                                    "type": "code",
                                    "input": {
                                        "code": "fn main(env) { #{\"name\": \"world\"} }"
                                    }
                                },
                                {
                                    "name": "finish",
                                    "type": "terminate",
                                    "input": {
                                        "output": {"goodbye": "${compute.name}"}
                                    }
                                }
                            ]
                        }
                    }"#,
                )
                .unwrap();

            let output = flow
                .execute(&Context::new(), &Input::new(Map::new()))
                .await
                .unwrap();
            assert!(output.is_terminated());
            assert_eq!(
                output.get("goodbye"),
                Some(&Value::String("world".into()))
            );
        });
    }

    #[test]
    fn test_duplicate_subtask_names_are_rejected() {
        let registry = registry();
        let err = registry
            .construct_from_json(
                r#"{
                    "name": "twins",
                    "type": "serial",
                    "input": {
                        "tasks": [
                            {"name": "same", "type": "terminate", "input": {}},
                            {"name": "same", "type": "terminate", "input": {}}
                        ]
                    }
                }"#,
            )
            .unwrap_err();
        assert!(err.to_string().contains("duplicate task name"));
    }
}
