use std::collections::{BTreeSet, HashMap};

use serde_json::{json, Value};
use thiserror::Error;

use crate::spatial::{covers, covers_point, distance, Geometry};

/// Expressions deeper than this are rejected up front. Campaign rules are
/// authored by hand; anything past this depth is a bug or an attack.
const MAX_EXPRESSION_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LogicError {
    #[error("unknown operator '{0}'")]
    UnknownOperator(String),

    #[error("operator '{op}' expects {expected}, got {got} argument(s)")]
    BadArity {
        op: &'static str,
        expected: &'static str,
        got: usize,
    },

    #[error("operator '{op}': {detail}")]
    BadArgument { op: &'static str, detail: String },

    #[error("expression nests deeper than {MAX_EXPRESSION_DEPTH}")]
    TooDeep,
}

type LogicResult<T> = Result<T, LogicError>;

/// Evaluation input: the variable-addressable data tree plus anything the
/// domain operators need beyond it.
#[derive(Debug, Clone, Default)]
pub struct EvalInput {
    pub data: Value,
}

impl EvalInput {
    pub fn new(data: Value) -> Self {
        EvalInput { data }
    }

    fn lookup(&self, path: &str) -> Option<&Value> {
        if path.is_empty() {
            return Some(&self.data);
        }
        let mut current = &self.data;
        for part in path.split('.') {
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

type OperatorFn = fn(&[Value], &EvalInput) -> LogicResult<Value>;

/// The closed operator table. Conditions are parsed against it before they
/// are stored, so an unknown operator never reaches evaluation.
pub struct OperatorTable {
    operators: HashMap<&'static str, OperatorFn>,
}

/// Operators with short-circuit or binding semantics, dispatched before
/// argument evaluation. Closed alongside the table.
const SPECIAL_FORMS: &[&str] = &["var", "missing", "missing_some", "if", "?:", "and", "or"];

impl OperatorTable {
    /// JSONLogic core only.
    pub fn core() -> Self {
        let mut table = OperatorTable {
            operators: HashMap::new(),
        };
        table.register("==", op_loose_eq);
        table.register("===", op_strict_eq);
        table.register("!=", op_loose_neq);
        table.register("!==", op_strict_neq);
        table.register("!", op_not);
        table.register("!!", op_truthy);
        table.register(">", op_gt);
        table.register(">=", op_gte);
        table.register("<", op_lt);
        table.register("<=", op_lte);
        table.register("+", op_add);
        table.register("-", op_sub);
        table.register("*", op_mul);
        table.register("/", op_div);
        table.register("%", op_mod);
        table.register("min", op_min);
        table.register("max", op_max);
        table.register("in", op_in);
        table.register("cat", op_cat);
        table.register("substr", op_substr);
        table.register("merge", op_merge);
        table
    }

    /// Core plus the campaign domain extensions.
    pub fn with_domain_ops() -> Self {
        let mut table = Self::core();
        table.register("ST_Within", op_st_within);
        table.register("ST_Distance", op_st_distance);
        table.register("hasLevel", op_has_level);
        table.register("variable", op_variable);
        table
    }

    pub fn register(&mut self, name: &'static str, op: OperatorFn) {
        self.operators.insert(name, op);
    }

    pub fn knows(&self, name: &str) -> bool {
        self.operators.contains_key(name) || SPECIAL_FORMS.contains(&name)
    }

    /// Parse-time validation: rejects unknown operators and over-deep
    /// nesting before an expression is accepted into storage.
    pub fn check_expression(&self, expression: &Value) -> LogicResult<()> {
        self.check_at_depth(expression, 0)
    }

    fn check_at_depth(&self, expression: &Value, depth: usize) -> LogicResult<()> {
        if depth > MAX_EXPRESSION_DEPTH {
            return Err(LogicError::TooDeep);
        }
        match expression {
            // A single-key object is an operator application. Anything else
            // is a literal (inline GeoJSON, parameter bags) and evaluates to
            // itself, so nothing inside it is checked as an operator.
            Value::Object(map) if map.len() == 1 => {
                for (op, args) in map {
                    if !self.knows(op) {
                        return Err(LogicError::UnknownOperator(op.clone()));
                    }
                    for arg in iter_args(args) {
                        self.check_at_depth(arg, depth + 1)?;
                    }
                }
                Ok(())
            }
            Value::Array(items) => {
                for item in items {
                    self.check_at_depth(item, depth + 1)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Evaluates a JSONLogic expression. Literals evaluate to themselves;
    /// single-key objects apply the named operator.
    pub fn evaluate(&self, expression: &Value, input: &EvalInput) -> LogicResult<Value> {
        self.eval_at_depth(expression, input, 0)
    }

    fn eval_at_depth(
        &self,
        expression: &Value,
        input: &EvalInput,
        depth: usize,
    ) -> LogicResult<Value> {
        if depth > MAX_EXPRESSION_DEPTH {
            return Err(LogicError::TooDeep);
        }
        let map = match expression {
            Value::Object(map) if map.len() == 1 => map,
            Value::Array(items) => {
                let evaluated = items
                    .iter()
                    .map(|item| self.eval_at_depth(item, input, depth + 1))
                    .collect::<LogicResult<Vec<_>>>()?;
                return Ok(Value::Array(evaluated));
            }
            other => return Ok(other.clone()),
        };

        // map.len() == 1 by the match guard
        let Some((op, raw_args)) = map.iter().next() else {
            return Ok(expression.clone());
        };
        let args: Vec<&Value> = iter_args(raw_args).collect();

        match op.as_str() {
            "var" => self.eval_var(&args, input, depth),
            "missing" => self.eval_missing(&args, input, depth),
            "missing_some" => self.eval_missing_some(&args, input, depth),
            "if" | "?:" => self.eval_if(&args, input, depth),
            "and" => {
                let mut last = Value::Bool(true);
                for arg in &args {
                    last = self.eval_at_depth(arg, input, depth + 1)?;
                    if !truthy(&last) {
                        return Ok(last);
                    }
                }
                Ok(last)
            }
            "or" => {
                let mut last = Value::Bool(false);
                for arg in &args {
                    last = self.eval_at_depth(arg, input, depth + 1)?;
                    if truthy(&last) {
                        return Ok(last);
                    }
                }
                Ok(last)
            }
            name => {
                let op_fn = self
                    .operators
                    .get(name)
                    .ok_or_else(|| LogicError::UnknownOperator(name.to_string()))?;
                let evaluated = args
                    .iter()
                    .map(|arg| self.eval_at_depth(arg, input, depth + 1))
                    .collect::<LogicResult<Vec<_>>>()?;
                op_fn(&evaluated, input)
            }
        }
    }

    fn eval_var(&self, args: &[&Value], input: &EvalInput, depth: usize) -> LogicResult<Value> {
        let path_value = match args.first() {
            Some(arg) => self.eval_at_depth(arg, input, depth + 1)?,
            None => Value::String(String::new()),
        };
        let path = match &path_value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Null => String::new(),
            other => {
                return Err(LogicError::BadArgument {
                    op: "var",
                    detail: format!("path must be a string, got {other}"),
                })
            }
        };
        match input.lookup(&path) {
            Some(found) => Ok(found.clone()),
            None => match args.get(1) {
                Some(default) => self.eval_at_depth(default, input, depth + 1),
                None => Ok(Value::Null),
            },
        }
    }

    fn eval_missing(&self, args: &[&Value], input: &EvalInput, depth: usize) -> LogicResult<Value> {
        // JSONLogic allows {"missing": {"merge": ...}} so evaluate first.
        let keys = if args.len() == 1 {
            match self.eval_at_depth(args[0], input, depth + 1)? {
                Value::Array(keys) => keys,
                single => vec![single],
            }
        } else {
            args.iter()
                .map(|arg| self.eval_at_depth(arg, input, depth + 1))
                .collect::<LogicResult<Vec<_>>>()?
        };
        let mut missing = Vec::new();
        for key in keys {
            if let Value::String(path) = &key {
                if input.lookup(path).map_or(true, Value::is_null) {
                    missing.push(key.clone());
                }
            }
        }
        Ok(Value::Array(missing))
    }

    fn eval_missing_some(
        &self,
        args: &[&Value],
        input: &EvalInput,
        depth: usize,
    ) -> LogicResult<Value> {
        let (need, keys) = match args {
            [need, keys] => (
                as_number("missing_some", &self.eval_at_depth(need, input, depth + 1)?)?,
                self.eval_at_depth(keys, input, depth + 1)?,
            ),
            _ => {
                return Err(LogicError::BadArity {
                    op: "missing_some",
                    expected: "2",
                    got: args.len(),
                })
            }
        };
        let keys = match keys {
            Value::Array(keys) => keys,
            other => {
                return Err(LogicError::BadArgument {
                    op: "missing_some",
                    detail: format!("second argument must be an array, got {other}"),
                })
            }
        };
        let total = keys.len();
        let missing = self.eval_missing(
            &[&Value::Array(keys)],
            input,
            depth,
        )?;
        let missing_count = missing.as_array().map(Vec::len).unwrap_or(0);
        if (total - missing_count) as f64 >= need {
            Ok(json!([]))
        } else {
            Ok(missing)
        }
    }

    fn eval_if(&self, args: &[&Value], input: &EvalInput, depth: usize) -> LogicResult<Value> {
        let mut index = 0;
        while index + 1 < args.len() {
            let condition = self.eval_at_depth(args[index], input, depth + 1)?;
            if truthy(&condition) {
                return self.eval_at_depth(args[index + 1], input, depth + 1);
            }
            index += 2;
        }
        match args.get(index) {
            Some(fallback) => self.eval_at_depth(fallback, input, depth + 1),
            None => Ok(Value::Null),
        }
    }
}

/// Collects every data path an expression reads: `var` paths and `variable`
/// names (reported under the `variables.` prefix). This is what feeds the
/// dependency graph.
pub fn referenced_paths(expression: &Value) -> BTreeSet<String> {
    let mut paths = BTreeSet::new();
    collect_paths(expression, &mut paths);
    paths
}

fn collect_paths(expression: &Value, paths: &mut BTreeSet<String>) {
    match expression {
        Value::Object(map) => {
            for (op, args) in map {
                if op == "var" || op == "variable" {
                    if let Some(Value::String(path)) = iter_args(args).next() {
                        if op == "variable" {
                            paths.insert(format!("variables.{path}"));
                        } else {
                            paths.insert(path.clone());
                        }
                    }
                }
                for arg in iter_args(args) {
                    collect_paths(arg, paths);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_paths(item, paths);
            }
        }
        _ => {}
    }
}

/// Single arguments may be given bare instead of wrapped in an array.
fn iter_args(raw: &Value) -> Box<dyn Iterator<Item = &Value> + '_> {
    match raw {
        Value::Array(items) => Box::new(items.iter()),
        other => Box::new(std::iter::once(other)),
    }
}

/// JSONLogic truthiness: empty arrays and strings, zero and null are false.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(_) => true,
    }
}

fn as_number(op: &'static str, value: &Value) -> LogicResult<f64> {
    coerce_number(value).ok_or_else(|| LogicError::BadArgument {
        op,
        detail: format!("expected a number, got {value}"),
    })
}

fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(true) => Some(1.0),
        Value::Bool(false) | Value::Null => Some(0.0),
        _ => None,
    }
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < (i64::MAX as f64) {
        json!(n as i64)
    } else {
        json!(n)
    }
}

/// `==` with the numeric coercion JSONLogic applies; everything else falls
/// back to strict equality.
fn loose_eq(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (coerce_number(a), coerce_number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

fn op_loose_eq(args: &[Value], _: &EvalInput) -> LogicResult<Value> {
    binary("==", args).map(|(a, b)| Value::Bool(loose_eq(a, b)))
}

fn op_loose_neq(args: &[Value], _: &EvalInput) -> LogicResult<Value> {
    binary("!=", args).map(|(a, b)| Value::Bool(!loose_eq(a, b)))
}

fn op_strict_eq(args: &[Value], _: &EvalInput) -> LogicResult<Value> {
    binary("===", args).map(|(a, b)| Value::Bool(a == b))
}

fn op_strict_neq(args: &[Value], _: &EvalInput) -> LogicResult<Value> {
    binary("!==", args).map(|(a, b)| Value::Bool(a != b))
}

fn op_not(args: &[Value], _: &EvalInput) -> LogicResult<Value> {
    Ok(Value::Bool(!truthy(args.first().unwrap_or(&Value::Null))))
}

fn op_truthy(args: &[Value], _: &EvalInput) -> LogicResult<Value> {
    Ok(Value::Bool(truthy(args.first().unwrap_or(&Value::Null))))
}

fn binary<'a>(op: &'static str, args: &'a [Value]) -> LogicResult<(&'a Value, &'a Value)> {
    match args {
        [a, b] => Ok((a, b)),
        _ => Err(LogicError::BadArity {
            op,
            expected: "2",
            got: args.len(),
        }),
    }
}

/// Comparison chains: `{"<": [1, x, 3]}` is the between test.
fn compare(op: &'static str, args: &[Value], ok: fn(std::cmp::Ordering) -> bool) -> LogicResult<Value> {
    if args.len() < 2 {
        return Err(LogicError::BadArity {
            op,
            expected: "at least 2",
            got: args.len(),
        });
    }
    for pair in args.windows(2) {
        let a = as_number(op, &pair[0])?;
        let b = as_number(op, &pair[1])?;
        if !ok(a.total_cmp(&b)) {
            return Ok(Value::Bool(false));
        }
    }
    Ok(Value::Bool(true))
}

fn op_gt(args: &[Value], _: &EvalInput) -> LogicResult<Value> {
    compare(">", args, |ord| ord == std::cmp::Ordering::Greater)
}

fn op_gte(args: &[Value], _: &EvalInput) -> LogicResult<Value> {
    compare(">=", args, |ord| ord != std::cmp::Ordering::Less)
}

fn op_lt(args: &[Value], _: &EvalInput) -> LogicResult<Value> {
    compare("<", args, |ord| ord == std::cmp::Ordering::Less)
}

fn op_lte(args: &[Value], _: &EvalInput) -> LogicResult<Value> {
    compare("<=", args, |ord| ord != std::cmp::Ordering::Greater)
}

fn op_add(args: &[Value], _: &EvalInput) -> LogicResult<Value> {
    let mut total = 0.0;
    for arg in args {
        total += as_number("+", arg)?;
    }
    Ok(number_value(total))
}

fn op_sub(args: &[Value], _: &EvalInput) -> LogicResult<Value> {
    match args {
        [only] => Ok(number_value(-as_number("-", only)?)),
        [a, b] => Ok(number_value(as_number("-", a)? - as_number("-", b)?)),
        _ => Err(LogicError::BadArity {
            op: "-",
            expected: "1 or 2",
            got: args.len(),
        }),
    }
}

fn op_mul(args: &[Value], _: &EvalInput) -> LogicResult<Value> {
    let mut total = 1.0;
    for arg in args {
        total *= as_number("*", arg)?;
    }
    Ok(number_value(total))
}

fn op_div(args: &[Value], _: &EvalInput) -> LogicResult<Value> {
    let (a, b) = binary("/", args)?;
    let divisor = as_number("/", b)?;
    if divisor == 0.0 {
        return Err(LogicError::BadArgument {
            op: "/",
            detail: "division by zero".to_string(),
        });
    }
    Ok(number_value(as_number("/", a)? / divisor))
}

fn op_mod(args: &[Value], _: &EvalInput) -> LogicResult<Value> {
    let (a, b) = binary("%", args)?;
    let divisor = as_number("%", b)?;
    if divisor == 0.0 {
        return Err(LogicError::BadArgument {
            op: "%",
            detail: "modulo by zero".to_string(),
        });
    }
    Ok(number_value(as_number("%", a)? % divisor))
}

fn op_min(args: &[Value], _: &EvalInput) -> LogicResult<Value> {
    fold_numbers("min", args, f64::min)
}

fn op_max(args: &[Value], _: &EvalInput) -> LogicResult<Value> {
    fold_numbers("max", args, f64::max)
}

fn fold_numbers(op: &'static str, args: &[Value], fold: fn(f64, f64) -> f64) -> LogicResult<Value> {
    let mut numbers = args.iter().map(|arg| as_number(op, arg));
    let mut best = numbers.next().ok_or(LogicError::BadArity {
        op,
        expected: "at least 1",
        got: 0,
    })??;
    for n in numbers {
        best = fold(best, n?);
    }
    Ok(number_value(best))
}

fn op_in(args: &[Value], _: &EvalInput) -> LogicResult<Value> {
    let (needle, haystack) = binary("in", args)?;
    let found = match haystack {
        Value::Array(items) => items.contains(needle),
        Value::String(s) => match needle {
            Value::String(n) => s.contains(n.as_str()),
            _ => false,
        },
        _ => false,
    };
    Ok(Value::Bool(found))
}

fn op_cat(args: &[Value], _: &EvalInput) -> LogicResult<Value> {
    let mut out = String::new();
    for arg in args {
        match arg {
            Value::String(s) => out.push_str(s),
            Value::Null => {}
            other => out.push_str(&other.to_string()),
        }
    }
    Ok(Value::String(out))
}

fn op_substr(args: &[Value], _: &EvalInput) -> LogicResult<Value> {
    let source = match args.first() {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => {
            return Err(LogicError::BadArity {
                op: "substr",
                expected: "2 or 3",
                got: 0,
            })
        }
    };
    let chars: Vec<char> = source.chars().collect();
    let len = chars.len() as i64;
    let start = args
        .get(1)
        .and_then(coerce_number)
        .map(|n| n as i64)
        .unwrap_or(0);
    let start = if start < 0 {
        (len + start).max(0)
    } else {
        start.min(len)
    } as usize;
    let take = match args.get(2).and_then(coerce_number).map(|n| n as i64) {
        Some(count) if count < 0 => (len as usize - start).saturating_sub(count.unsigned_abs() as usize),
        Some(count) => count as usize,
        None => len as usize - start,
    };
    Ok(Value::String(chars[start..].iter().take(take).collect()))
}

fn op_merge(args: &[Value], _: &EvalInput) -> LogicResult<Value> {
    let mut merged = Vec::new();
    for arg in args {
        match arg {
            Value::Array(items) => merged.extend(items.iter().cloned()),
            other => merged.push(other.clone()),
        }
    }
    Ok(Value::Array(merged))
}

fn as_geometry(op: &'static str, value: &Value) -> LogicResult<Geometry> {
    serde_json::from_value(value.clone()).map_err(|err| LogicError::BadArgument {
        op,
        detail: format!("expected GeoJSON geometry: {err}"),
    })
}

/// `ST_Within(a, b)`: geometry `a` lies within region `b` (boundary
/// inclusive, matching the kernel's covers semantics).
fn op_st_within(args: &[Value], _: &EvalInput) -> LogicResult<Value> {
    let (a, b) = binary("ST_Within", args)?;
    let inner = as_geometry("ST_Within", a)?;
    let outer = as_geometry("ST_Within", b)?;
    let within = match inner {
        Geometry::Point { coordinates, .. } => covers_point(&outer, coordinates),
        ref region => covers(&outer, region),
    };
    Ok(Value::Bool(within))
}

fn op_st_distance(args: &[Value], _: &EvalInput) -> LogicResult<Value> {
    let (a, b) = binary("ST_Distance", args)?;
    let left = as_geometry("ST_Distance", a)?;
    let right = as_geometry("ST_Distance", b)?;
    Ok(json!(distance(&left, &right)))
}

/// `hasLevel(entity, min)`: the entity state carries a numeric `level` at or
/// above the threshold.
fn op_has_level(args: &[Value], _: &EvalInput) -> LogicResult<Value> {
    let (entity, min) = binary("hasLevel", args)?;
    let threshold = as_number("hasLevel", min)?;
    let level = entity
        .get("level")
        .and_then(coerce_number)
        .unwrap_or(f64::NEG_INFINITY);
    Ok(Value::Bool(level >= threshold))
}

/// `variable(name)`: scope-inherited variable lookup. The context assembly
/// has already merged parent scopes into `variables`, most specific last.
fn op_variable(args: &[Value], input: &EvalInput) -> LogicResult<Value> {
    let name = match args.first() {
        Some(Value::String(name)) => name,
        other => {
            return Err(LogicError::BadArgument {
                op: "variable",
                detail: format!("expected a variable name, got {other:?}"),
            })
        }
    };
    Ok(input
        .lookup(&format!("variables.{name}"))
        .cloned()
        .unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> EvalInput {
        EvalInput::new(json!({
            "entity": { "name": "Cathedral", "level": 2 },
            "settlement": { "name": "Sandpoint", "level": 3 },
            "worldTime": "4707-03-15T12:00:00Z",
            "variables": { "morale": 5, "festival": true },
        }))
    }

    fn eval(expr: Value) -> Value {
        OperatorTable::with_domain_ops()
            .evaluate(&expr, &input())
            .unwrap()
    }

    #[test]
    fn literals_evaluate_to_themselves() {
        assert_eq!(eval(json!(42)), json!(42));
        assert_eq!(eval(json!("plain")), json!("plain"));
        assert_eq!(eval(json!(null)), json!(null));
    }

    #[test]
    fn var_walks_dotted_paths_with_defaults() {
        assert_eq!(eval(json!({"var": "settlement.level"})), json!(3));
        assert_eq!(eval(json!({"var": ["absent.path", "fallback"]})), json!("fallback"));
        assert_eq!(eval(json!({"var": "absent.path"})), json!(null));
    }

    #[test]
    fn comparisons_and_boolean_composition() {
        assert_eq!(
            eval(json!({"and": [
                {">=": [{"var": "settlement.level"}, 3]},
                {"var": "variables.festival"},
            ]})),
            json!(true)
        );
        assert_eq!(
            eval(json!({"or": [false, {"var": "variables.morale"}]})),
            json!(5)
        );
        assert_eq!(eval(json!({"<": [1, 2, 3]})), json!(true));
        assert_eq!(eval(json!({"<": [1, 5, 3]})), json!(false));
    }

    #[test]
    fn if_takes_the_first_truthy_branch() {
        let expr = json!({"if": [
            {"<": [{"var": "settlement.level"}, 2]}, "hamlet",
            {"<": [{"var": "settlement.level"}, 5]}, "town",
            "city",
        ]});
        assert_eq!(eval(expr), json!("town"));
    }

    #[test]
    fn loose_and_strict_equality_differ_on_coercion() {
        assert_eq!(eval(json!({"==": [5, "5"]})), json!(true));
        assert_eq!(eval(json!({"===": [5, "5"]})), json!(false));
        assert_eq!(eval(json!({"!=": [5, "5"]})), json!(false));
    }

    #[test]
    fn arithmetic_folds_and_guards_zero_division() {
        assert_eq!(eval(json!({"+": [1, 2, 3]})), json!(6));
        assert_eq!(eval(json!({"*": [2, 2, 2]})), json!(8));
        assert_eq!(eval(json!({"-": [10, 4]})), json!(6));
        assert_eq!(eval(json!({"-": [5]})), json!(-5));
        let err = OperatorTable::core()
            .evaluate(&json!({"/": [1, 0]}), &EvalInput::default())
            .unwrap_err();
        assert!(matches!(err, LogicError::BadArgument { op: "/", .. }));
    }

    #[test]
    fn in_checks_arrays_and_substrings() {
        assert_eq!(eval(json!({"in": ["gm", ["owner", "gm"]]})), json!(true));
        assert_eq!(eval(json!({"in": ["and", "Sandpoint"]})), json!(true));
        assert_eq!(eval(json!({"in": ["xyz", "Sandpoint"]})), json!(false));
    }

    #[test]
    fn missing_reports_unset_paths() {
        assert_eq!(
            eval(json!({"missing": ["settlement.level", "settlement.crest"]})),
            json!(["settlement.crest"])
        );
        assert_eq!(
            eval(json!({"missing_some": [1, ["settlement.level", "settlement.crest"]]})),
            json!([])
        );
    }

    #[test]
    fn unknown_operators_fail_at_parse_time() {
        let table = OperatorTable::with_domain_ops();
        let err = table
            .check_expression(&json!({"frobnicate": [1, 2]}))
            .unwrap_err();
        assert_eq!(err, LogicError::UnknownOperator("frobnicate".to_string()));

        // nested occurrences are found too
        let err = table
            .check_expression(&json!({"and": [true, {"bogus": 1}]}))
            .unwrap_err();
        assert_eq!(err, LogicError::UnknownOperator("bogus".to_string()));
    }

    #[test]
    fn registration_extends_the_closed_table() {
        let mut table = OperatorTable::core();
        assert!(table.check_expression(&json!({"double": 2})).is_err());
        fn double(args: &[Value], _: &EvalInput) -> LogicResult<Value> {
            Ok(json!(args.first().and_then(coerce_number).unwrap_or(0.0) * 2.0))
        }
        table.register("double", double);
        assert!(table.check_expression(&json!({"double": 2})).is_ok());
        assert_eq!(
            table.evaluate(&json!({"double": 21}), &EvalInput::default()).unwrap(),
            json!(42.0)
        );
    }

    #[test]
    fn domain_operator_variable_reads_merged_scope() {
        assert_eq!(eval(json!({"variable": "morale"})), json!(5));
        assert_eq!(eval(json!({"variable": "unset"})), json!(null));
    }

    #[test]
    fn domain_operator_has_level() {
        assert_eq!(eval(json!({"hasLevel": [{"var": "settlement"}, 3]})), json!(true));
        assert_eq!(eval(json!({"hasLevel": [{"var": "settlement"}, 4]})), json!(false));
        assert_eq!(eval(json!({"hasLevel": [{"var": "entity"}, 3]})), json!(false));
    }

    #[test]
    fn domain_operator_st_within() {
        let region = json!({
            "type": "Polygon",
            "coordinates": [[[0.0, 0.0], [100.0, 0.0], [100.0, 100.0], [0.0, 100.0], [0.0, 0.0]]],
        });
        let inside = json!({"type": "Point", "coordinates": [50.0, 50.0]});
        let outside = json!({"type": "Point", "coordinates": [150.0, 50.0]});
        assert_eq!(eval(json!({"ST_Within": [inside, region.clone()]})), json!(true));
        assert_eq!(eval(json!({"ST_Within": [outside, region]})), json!(false));
    }

    #[test]
    fn domain_operator_st_distance() {
        let a = json!({"type": "Point", "coordinates": [0.0, 0.0]});
        let b = json!({"type": "Point", "coordinates": [3.0, 4.0]});
        assert_eq!(eval(json!({"ST_Distance": [a, b]})), json!(5.0));
    }

    #[test]
    fn referenced_paths_flatten_var_and_variable_reads() {
        let expr = json!({"and": [
            {">=": [{"var": "settlement.level"}, 3]},
            {"==": [{"variable": "morale"}, 5]},
            {"if": [{"var": "entity.resolved"}, {"var": "entity.level"}, 0]},
        ]});
        let paths = referenced_paths(&expr);
        let expected: BTreeSet<String> = [
            "settlement.level",
            "variables.morale",
            "entity.resolved",
            "entity.level",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        assert_eq!(paths, expected);
    }

    #[test]
    fn evaluation_is_deterministic() {
        let expr = json!({"if": [
            {">": [{"variable": "morale"}, 3]},
            {"+": [{"var": "settlement.level"}, {"variable": "morale"}]},
            0,
        ]});
        let table = OperatorTable::with_domain_ops();
        let first = table.evaluate(&expr, &input()).unwrap();
        let second = table.evaluate(&expr, &input()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, json!(8));
    }

    #[test]
    fn depth_limit_rejects_hostile_nesting() {
        let mut expr = json!(1);
        for _ in 0..(MAX_EXPRESSION_DEPTH + 2) {
            expr = json!({"!!": expr});
        }
        let table = OperatorTable::core();
        assert_eq!(table.check_expression(&expr).unwrap_err(), LogicError::TooDeep);
    }
}
