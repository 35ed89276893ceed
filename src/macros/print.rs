//! `<<print>>`, `<<=>>` and `<<->>`.

use std::rc::Rc;

use serde_json::Value;

use crate::context::MacroContext;
use crate::engine::Engine;
use crate::error::{MacroError, RegistryError};
use crate::expr;
use crate::registry::{MacroDefinition, Registry};

pub fn register(registry: &mut Registry) -> Result<(), RegistryError> {
    registry.add(&["print", "=", "-"], MacroDefinition::new(print).skip_args())
}

/// Evaluate the raw argument text and output the result. `<<->>` outputs
/// plain text, the other two wikify it.
fn print(engine: &Engine, ctx: &Rc<MacroContext>) -> Result<(), MacroError> {
    let expression = ctx.args().raw().trim();
    if expression.is_empty() {
        ctx.error("no expression specified", None);
        return Ok(());
    }

    let result = expr::evaluate(expression, &mut engine.state_mut());
    match result {
        Err(err) => {
            ctx.error(format!("bad evaluation: {err}"), None);
        }
        Ok(Value::Null) => {}
        Ok(value) => {
            let text = expr::to_display(&value);
            if ctx.name() == "-" {
                ctx.output().push_text(&text);
            } else {
                engine.wikify(&ctx.output(), &text);
            }
        }
    }
    Ok(())
}
