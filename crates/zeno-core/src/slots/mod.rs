//! Built-in slots every engine carries.

mod control;
mod functions;
mod include;
mod misc;

use std::sync::Arc;

pub use control::error_value;
pub use functions::{FunctionDef, MAX_CALL_DEPTH, function_key};
pub use include::INCLUDE_STACK;
pub use misc::duration_of;

use crate::engine::Engine;
use crate::registry::SlotMetadata;

/// Register the control-flow, function and utility slots on `engine`.
pub fn register_core(engine: &Engine) {
    engine.register(
        "if",
        Arc::new(control::If),
        SlotMetadata::new("Run `then` when the condition is truthy, otherwise `else`")
            .example("if: \"$age >= 18\"")
            .required("condition", "any", "Value or expression tested for truthiness"),
    );
    engine.register(
        "switch",
        Arc::new(control::Switch),
        SlotMetadata::new("Run the first `case` whose value matches, else `default`")
            .required("value", "any", "Subject compared against each case"),
    );
    engine.register(
        "for",
        Arc::new(control::For),
        SlotMetadata::new("Iterate a list, a map or an `a..b` range")
            .example("for: $users\n  as: user\n  do: ...")
            .required("items", "any", "List, map or range string")
            .input("as", "string", "Item variable name (default `item`)")
            .input("index", "string", "Index or key variable name")
            .input("key", "string", "Alias of `index`"),
    );
    engine.register(
        "while",
        Arc::new(control::While),
        SlotMetadata::new("Repeat the body while the condition holds")
            .required("condition", "any", "Re-evaluated before each iteration")
            .block("do"),
    );
    engine.register(
        "break",
        Arc::new(control::Break),
        SlotMetadata::new("Leave the innermost loop"),
    );
    engine.register(
        "continue",
        Arc::new(control::Continue),
        SlotMetadata::new("Skip to the next loop iteration"),
    );
    engine.register(
        "try",
        Arc::new(control::Try),
        SlotMetadata::new("Run `do`; on failure run `catch` with the error bound; always run `finally`")
            .input("as", "string", "Error variable name (default `error`)")
            .block("do"),
    );
    engine.register(
        "fn",
        Arc::new(functions::Declare),
        SlotMetadata::new("Declare a named function")
            .required("name", "string", "Function name")
            .input("params", "list", "Parameter names")
            .block("do"),
    );
    engine.register(
        "call",
        Arc::new(functions::Call),
        SlotMetadata::new("Call a declared function with named arguments")
            .required("name", "string", "Function name")
            .input("args", "list", "Positional arguments")
            .input("as", "string", "Variable receiving the return value"),
    );
    engine.register(
        "return",
        Arc::new(functions::Return),
        SlotMetadata::new("Return a value from the current function").input("value", "any", ""),
    );
    engine.register(
        "include",
        Arc::new(include::Include),
        SlotMetadata::new("Load another program file and run it in the current scope")
            .required("path", "string", "Path relative to the including file")
            .value_type("string"),
    );
    engine.register(
        "var",
        Arc::new(misc::Var),
        SlotMetadata::new("Declare a variable in the current scope")
            .required("name", "string", "Variable name")
            .input("value", "any", "Initial value"),
    );
    engine.register(
        "log",
        Arc::new(misc::Log),
        SlotMetadata::new("Write a message to the runtime log")
            .required("message", "any", "Text to log")
            .input("level", "string", "trace, debug, info, warn or error"),
    );
    engine.register(
        "sleep",
        Arc::new(misc::Sleep),
        SlotMetadata::new("Pause for a duration, bounded by the request deadline")
            .example("sleep: 250ms")
            .required("duration", "duration", "Milliseconds or a duration string")
            .value_type("duration"),
    );
    engine.register("noop", Arc::new(misc::Noop), SlotMetadata::new("Do nothing"));
}
