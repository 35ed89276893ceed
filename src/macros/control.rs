//! Conditionals and loops: `<<if>>`, `<<for>>`, `<<break>>` and
//! `<<continue>>`.

use std::rc::Rc;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::context::MacroContext;
use crate::engine::{Engine, LoopBreak};
use crate::error::{MacroError, RegistryError};
use crate::expr;
use crate::macros::debug_modes;
use crate::registry::{MacroDefinition, Registry};

static ELSE_IF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*if\b").expect("valid else-if regex"));

static STRING_LITERAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""(?:\\.|[^"\\])*"|'(?:\\.|[^'\\])*'"#).expect("valid string literal regex")
});

static ASSIGNMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^!%&*+\-/<=>?^|]=[^=>]").expect("valid assignment regex"));

static RANGE_FORM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^(?:\S.*?\s+)?range\s+\S.*$").expect("valid range form regex"));

static RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?s)^(?:(?:([$_][$A-Za-z_][$0-9A-Za-z_]*)\s*,\s*)?([$_][$A-Za-z_][$0-9A-Za-z_]*)\s+)?range\s+(\S.*?)$",
    )
    .expect("valid range regex")
});

static THREE_PART: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([^;]*?)\s*;\s*([^;]*?)\s*;\s*([^;]*?)$").expect("valid three-part regex")
});

static FOR_IN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\S+\s+in\s+\S+").expect("valid for-in regex"));

static FOR_OF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\S+\s+of\s+\S+").expect("valid for-of regex"));

pub fn register(registry: &mut Registry) -> Result<(), RegistryError> {
    registry.add(
        &["if"],
        MacroDefinition::new(if_macro)
            .skip_args()
            .with_tags(&["elseif", "else"]),
    )?;
    registry.add(&["for"], MacroDefinition::new(for_macro).container().skip_args())?;
    registry.add(&["break", "continue"], MacroDefinition::new(loop_control).skip_args())
}

/// Whether `expression` contains a lone `=` outside of string literals.
fn has_assignment(expression: &str) -> bool {
    ASSIGNMENT.is_match(&STRING_LITERAL.replace_all(expression, r#""""#))
}

fn if_macro(engine: &Engine, ctx: &Rc<MacroContext>) -> Result<(), MacroError> {
    let payload = ctx.payload();
    let debug = engine.config().debug;

    for (i, clause) in payload.iter().enumerate() {
        let raw = clause.args.raw().trim();
        let suffix = if i == 0 {
            String::new()
        } else {
            format!(" (#{i})")
        };

        if clause.name == "else" {
            if !raw.is_empty() {
                if ELSE_IF.is_match(raw) {
                    ctx.error(
                        format!(
                            "whitespace is not allowed between the \"else\" and \"if\" in <<elseif>> clause{suffix}"
                        ),
                        None,
                    );
                } else {
                    ctx.error(
                        format!(
                            "<<else>> does not accept a conditional expression (perhaps you meant to use <<elseif>>), invalid: {raw}"
                        ),
                        None,
                    );
                }
                return Ok(());
            }
            if i + 1 != payload.len() {
                ctx.error("<<else>> must be the final clause", None);
                return Ok(());
            }
        } else if raw.is_empty() {
            ctx.error(
                format!(
                    "no conditional expression specified for <<{}>> clause{suffix}",
                    clause.name
                ),
                None,
            );
            return Ok(());
        } else if debug && has_assignment(raw) {
            ctx.error(
                format!(
                    "assignment operator found within <<{}>> clause{suffix} (perhaps you meant to use an equality operator: ==, ===, eq, is), invalid: {raw}",
                    clause.name
                ),
                None,
            );
            return Ok(());
        }
    }

    let mut taken = None;
    for (i, clause) in payload.iter().enumerate() {
        if debug {
            ctx.create_debug_view(Some(clause.name.as_str()), Some(clause.source.as_str()))
                .set_modes(&[("nonvoid", false)]);
        }

        let passed = clause.name == "else" || {
            let result = expr::evaluate_condition(clause.args.raw(), &mut engine.state_mut());
            match result {
                Ok(passed) => passed,
                Err(err) => {
                    ctx.error(
                        format!(
                            "bad conditional expression in <<{}>> clause{}: {err}",
                            if i == 0 { "if" } else { "elseif" },
                            if i == 0 { String::new() } else { format!(" (#{i})") }
                        ),
                        None,
                    );
                    return Ok(());
                }
            }
        };

        if passed {
            engine.wikify(&ctx.output(), &clause.contents);
            taken = Some(i);
            break;
        }
        debug_modes(ctx, &["hidden", "invalid"]);
    }

    if debug {
        let start = taken.map_or(payload.len(), |i| i + 1);
        for clause in &payload[start..] {
            ctx.create_debug_view(Some(clause.name.as_str()), Some(clause.source.as_str()))
                .set_modes(&[("nonvoid", false), ("hidden", true), ("invalid", true)]);
        }
        let closing = format!("/{}", ctx.display_name());
        let title = format!("<<{closing}>>");
        ctx.create_debug_view(Some(closing.as_str()), Some(title.as_str()))
            .set_modes(&[("nonvoid", false), ("hidden", taken.is_none())]);
    }
    Ok(())
}

fn for_macro(engine: &Engine, ctx: &Rc<MacroContext>) -> Result<(), MacroError> {
    let raw = ctx.args().raw().trim();
    let body = ctx.payload()[0].contents.as_str();
    let body = body.strip_suffix('\n').unwrap_or(body);
    let _reset = LoopReset::enter(engine);

    if raw.is_empty() {
        return run_loop(engine, ctx, body, None, None, None);
    }

    if RANGE_FORM.is_match(raw) {
        let Some(caps) = RANGE.captures(raw) else {
            ctx.error("invalid range form syntax, format: [index ,] value range collection", None);
            return Ok(());
        };
        let key = caps.get(1).map(|m| m.as_str());
        let value = caps.get(2).map(|m| m.as_str());
        return run_range(engine, ctx, body, key, value, &caps[3]);
    }

    if FOR_IN.is_match(raw) {
        ctx.error("invalid syntax, for…in is not supported; see: for…range", None);
        return Ok(());
    }
    if FOR_OF.is_match(raw) {
        ctx.error("invalid syntax, for…of is not supported; see: for…range", None);
        return Ok(());
    }

    if raw.contains(';') {
        let Some(caps) = THREE_PART.captures(raw) else {
            ctx.error("invalid 3-part conditional form syntax, format: [init] ; [condition] ; [post]", None);
            return Ok(());
        };
        let part = |i: usize| caps.get(i).map(|m| m.as_str()).filter(|s| !s.is_empty());
        return run_loop(engine, ctx, body, part(1), part(2), part(3));
    }
    run_loop(engine, ctx, body, None, Some(raw), None)
}

/// Clears any pending loop control when the loop ends, however it ends.
struct LoopReset<'a>(&'a Engine);

impl<'a> LoopReset<'a> {
    fn enter(engine: &'a Engine) -> Self {
        engine.temp_mut().loop_break = None;
        Self(engine)
    }
}

impl Drop for LoopReset<'_> {
    fn drop(&mut self) {
        self.0.temp_mut().loop_break = None;
    }
}

/// Whether the body asked to leave the loop. A pending `<<continue>>` is
/// consumed here.
fn take_break(engine: &Engine) -> bool {
    engine.temp_mut().loop_break.take() == Some(LoopBreak::Break)
}

fn loop_body<'a>(body: &'a str, first: bool) -> &'a str {
    if first {
        body.strip_prefix('\n').unwrap_or(body)
    } else {
        body
    }
}

fn run_loop(
    engine: &Engine,
    ctx: &Rc<MacroContext>,
    body: &str,
    init: Option<&str>,
    condition: Option<&str>,
    post: Option<&str>,
) -> Result<(), MacroError> {
    let max = engine.config().max_loop_iterations;
    let mut remaining = max;

    if body.trim().is_empty() {
        debug_modes(ctx, &["hidden"]);
    }

    if let Some(init) = init {
        let result = expr::evaluate(init, &mut engine.state_mut());
        if let Err(err) = result {
            ctx.error(format!("bad init expression: {err}"), None);
            return Ok(());
        }
    }

    let mut first = true;
    loop {
        if let Some(condition) = condition {
            let result = expr::evaluate_condition(condition, &mut engine.state_mut());
            match result {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    ctx.error(format!("bad conditional expression: {err}"), None);
                    return Ok(());
                }
            }
        }
        if remaining == 0 {
            ctx.error(format!("exceeded configured maximum loop iterations ({max})"), None);
            return Ok(());
        }
        remaining -= 1;

        engine.wikify(&ctx.output(), loop_body(body, first));
        first = false;
        if take_break(engine) {
            break;
        }

        if let Some(post) = post {
            let result = expr::evaluate(post, &mut engine.state_mut());
            if let Err(err) = result {
                ctx.error(format!("bad post expression: {err}"), None);
                return Ok(());
            }
        }
    }
    Ok(())
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

type RangeEntries = Box<dyn Iterator<Item = (Value, Value)>>;

/// Key/value pairs a range loop walks over, produced on demand.
fn range_entries(value: Value) -> Result<RangeEntries, String> {
    match value {
        Value::Number(n) => {
            let count = n.as_f64().unwrap_or(f64::NAN);
            if count.fract() != 0.0 || !count.is_finite() {
                return Err(format!("{count} is not an integer"));
            }
            Ok(Box::new(
                (0..count.max(0.0) as i64).map(|i| (Value::from(i), Value::from(i))),
            ))
        }
        Value::String(text) => {
            let chars: Vec<char> = text.chars().collect();
            Ok(Box::new(
                chars
                    .into_iter()
                    .enumerate()
                    .map(|(i, ch)| (Value::from(i), Value::String(ch.to_string()))),
            ))
        }
        Value::Array(items) => Ok(Box::new(
            items
                .into_iter()
                .enumerate()
                .map(|(i, item)| (Value::from(i), item)),
        )),
        Value::Object(map) => Ok(Box::new(
            map.into_iter().map(|(key, item)| (Value::String(key), item)),
        )),
        other => Err(format!("unsupported range expression type: {}", type_name(&other))),
    }
}

fn run_range(
    engine: &Engine,
    ctx: &Rc<MacroContext>,
    body: &str,
    key: Option<&str>,
    value: Option<&str>,
    expression: &str,
) -> Result<(), MacroError> {
    let collection = match expr::evaluate(expression, &mut engine.state_mut()) {
        Ok(collection) => collection,
        Err(err) => {
            ctx.error(format!("bad range expression: {err}"), None);
            return Ok(());
        }
    };
    let entries = match range_entries(collection) {
        Ok(entries) => entries,
        Err(message) => {
            ctx.error(message, None);
            return Ok(());
        }
    };

    if body.trim().is_empty() {
        debug_modes(ctx, &["hidden"]);
    }

    let max = engine.config().max_loop_iterations;
    let mut first = true;
    for (index, (entry_key, entry_value)) in entries.enumerate() {
        if index >= max {
            ctx.error(format!("exceeded configured maximum loop iterations ({max})"), None);
            return Ok(());
        }
        {
            let mut state = engine.state_mut();
            if let Some(key) = key {
                state.set(key, entry_key)?;
            }
            if let Some(value) = value {
                state.set(value, entry_value)?;
            }
        }

        engine.wikify(&ctx.output(), loop_body(body, first));
        first = false;
        if take_break(engine) {
            break;
        }
    }
    Ok(())
}

fn loop_control(engine: &Engine, ctx: &Rc<MacroContext>) -> Result<(), MacroError> {
    if !ctx.context_some(|parent| parent.name() == "for") {
        ctx.error("must only be used in conjunction with its parent macro <<for>>", None);
        return Ok(());
    }

    engine.temp_mut().loop_break = Some(if ctx.name() == "continue" {
        LoopBreak::Continue
    } else {
        LoopBreak::Break
    });
    debug_modes(ctx, &["hidden"]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::output::Output;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn engine() -> Engine {
        Engine::new(Config::default()).unwrap()
    }

    fn render(engine: &Engine, source: &str) -> Output {
        let out = Output::new();
        engine.wikify(&out, source);
        out
    }

    #[test]
    fn test_if_chain() {
        let engine = engine();
        let source = "<<if $n eq 1>>one<<elseif $n eq 2>>two<<else>>many<</if>>";
        engine.state_mut().set("$n", json!(1)).unwrap();
        assert_eq!(render(&engine, source).text(), "one");
        engine.state_mut().set("$n", json!(2)).unwrap();
        assert_eq!(render(&engine, source).text(), "two");
        engine.state_mut().set("$n", json!(9)).unwrap();
        assert_eq!(render(&engine, source).text(), "many");
    }

    #[test]
    fn test_if_clause_errors() {
        let engine = engine();
        assert_eq!(
            render(&engine, "<<if true>>a<<else>>b<<elseif true>>c<</if>>").errors(),
            vec!["<<if>>: <<else>> must be the final clause".to_string()]
        );
        assert_eq!(
            render(&engine, "<<if true>>a<<elseif>>b<</if>>").errors(),
            vec!["<<if>>: no conditional expression specified for <<elseif>> clause (#1)".to_string()]
        );
        assert_eq!(
            render(&engine, "<<if>>a<</if>>").errors(),
            vec!["<<if>>: no conditional expression specified for <<if>> clause".to_string()]
        );
        let errors = render(&engine, "<<if true>>a<<else if true>>b<</if>>").errors();
        assert!(errors[0].contains("whitespace is not allowed"));
        let errors = render(&engine, "<<if 1 +>>a<</if>>").errors();
        assert!(errors[0].starts_with("<<if>>: bad conditional expression in <<if>> clause: "));
    }

    #[test]
    fn test_assignment_in_condition_is_flagged_in_debug() {
        let engine = Engine::new(Config {
            debug: true,
            ..Config::default()
        })
        .unwrap();
        let errors = render(&engine, "<<if $x = 1>>a<</if>>").errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("assignment operator found within <<if>> clause"));
        assert!(render(&engine, "<<if $x == \"a=b\">>a<</if>>").errors().is_empty());
    }

    #[test]
    fn test_three_part_loop() {
        let engine = engine();
        let out = render(&engine, "<<for _i to 0; _i lt 3; _i += 1>><<print _i>><</for>>");
        assert_eq!(out.text(), "012");
    }

    #[test]
    fn test_conditional_loop_with_break_and_continue() {
        let engine = engine();
        let source = concat!(
            "<<set _i to 0>>",
            "<<for _i lt 10>><<set _i += 1>>",
            "<<if _i eq 2>><<continue>><</if>>",
            "<<if _i eq 5>><<break>><</if>>",
            "<<print _i>>,",
            "<</for>>done"
        );
        let out = render(&engine, source);
        assert_eq!(out.text(), "1,3,4,done");
        assert!(engine.temp().loop_break.is_none());
    }

    #[test]
    fn test_loop_safety_limit() {
        let engine = Engine::new(Config {
            max_loop_iterations: 5,
            ..Config::default()
        })
        .unwrap();
        let out = render(&engine, "<<for>>x<</for>>");
        assert_eq!(out.text(), "xxxxxError: <<for>>: exceeded configured maximum loop iterations (5)");

        let out = render(&engine, "<<for _i range 1000000000000>>x<</for>>");
        assert_eq!(out.text(), "xxxxxError: <<for>>: exceeded configured maximum loop iterations (5)");
        let out = render(&engine, "<<for _i range 5>>y<</for>>");
        assert_eq!(out.text(), "yyyyy");
        assert!(out.errors().is_empty());
    }

    #[test]
    fn test_range_forms() {
        let engine = engine();
        engine.state_mut().set("$list", json!(["a", "b", "c"])).unwrap();
        engine.state_mut().set("$map", json!({"x": 1, "y": 2})).unwrap();

        let out = render(&engine, "<<for _i, _v range $list>>[<<print _i>>=<<print _v>>]<</for>>");
        assert_eq!(out.text(), "[0=a][1=b][2=c]");
        let out = render(&engine, "<<for _k, _v range $map>><<print _k>><<print _v>><</for>>");
        assert_eq!(out.text(), "x1y2");
        let out = render(&engine, "<<for _c range \"hey\">><<print _c>>.<</for>>");
        assert_eq!(out.text(), "h.e.y.");
        let out = render(&engine, "<<for range 3>>*<</for>>");
        assert_eq!(out.text(), "***");
    }

    #[test]
    fn test_range_errors() {
        let engine = engine();
        assert_eq!(
            render(&engine, "<<for _v range true>>x<</for>>").errors(),
            vec!["<<for>>: unsupported range expression type: boolean".to_string()]
        );
        assert_eq!(
            render(&engine, "<<for _v range 2.5>>x<</for>>").errors(),
            vec!["<<for>>: 2.5 is not an integer".to_string()]
        );
    }

    #[test]
    fn test_for_in_and_for_of_are_rejected() {
        let engine = engine();
        let errors = render(&engine, "<<for _x in $list>>x<</for>>").errors();
        assert!(errors[0].contains("for…in is not supported"));
        let errors = render(&engine, "<<for _x of $list>>x<</for>>").errors();
        assert!(errors[0].contains("for…of is not supported"));
    }

    #[test]
    fn test_first_iteration_drops_leading_newline() {
        let engine = engine();
        let out = render(&engine, "<<for range 2>>\nrow\n<</for>>");
        assert_eq!(out.text(), "row\nrow");
    }

    #[test]
    fn test_break_outside_loop() {
        let engine = engine();
        assert_eq!(
            render(&engine, "<<break>>").errors(),
            vec!["<<break>>: must only be used in conjunction with its parent macro <<for>>".to_string()]
        );
    }
}
