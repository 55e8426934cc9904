//! Scalar SQL functions: marshalling for user callbacks and the baseline set
//! registered on every open.

use crate::value::Value;
use rusqlite::functions::{Context, FunctionFlags};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, Error as SqlError, ffi};
use std::panic::AssertUnwindSafe;

/// Result of a user function. `Err` text becomes the SQL error for that call.
pub type FunctionResult = std::result::Result<Value, String>;

fn host_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(n) => Value::Integer(n),
        ValueRef::Real(x) => Value::Real(x),
        ValueRef::Text(text) => Value::Text(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(bytes) => Value::Blob(bytes.to_vec()),
    }
}

fn sql_value(value: Value) -> rusqlite::Result<SqlValue> {
    match value {
        Value::Null => Ok(SqlValue::Null),
        Value::Bool(b) => Ok(SqlValue::Integer(i64::from(b))),
        Value::Integer(n) => Ok(SqlValue::Integer(n)),
        Value::Real(x) => Ok(SqlValue::Real(x)),
        Value::Text(text) => Ok(SqlValue::Text(text)),
        Value::Blob(bytes) => Ok(SqlValue::Blob(bytes)),
        other => Err(SqlError::UserFunctionError(
            format!(
                "Wrong API use : tried to return a value of an unknown type ({})",
                other.type_name()
            )
            .into(),
        )),
    }
}

/// Registers `func` under `name`. Arguments arrive as host values; an `Err`
/// (or a panic) fails only the invocation that raised it.
pub(crate) fn create_function<F>(
    conn: &Connection,
    name: &str,
    n_args: i32,
    func: F,
) -> rusqlite::Result<()>
where
    F: Fn(&[Value]) -> FunctionResult + Send + 'static,
{
    let func = AssertUnwindSafe(func);
    conn.create_scalar_function(name, n_args, FunctionFlags::SQLITE_UTF8, move |ctx| {
        let args: Vec<Value> = (0..ctx.len()).map(|idx| host_value(ctx.get_raw(idx))).collect();
        let result = (*func)(&args).map_err(|msg| SqlError::UserFunctionError(msg.into()))?;
        sql_value(result)
    })
}

fn text_arg(ctx: &Context<'_>, idx: usize) -> Option<String> {
    match ctx.get_raw(idx) {
        ValueRef::Null => None,
        ValueRef::Integer(n) => Some(n.to_string()),
        ValueRef::Real(x) => Some(x.to_string()),
        ValueRef::Text(text) | ValueRef::Blob(text) => {
            Some(String::from_utf8_lossy(text).into_owned())
        }
    }
}

fn int_arg(ctx: &Context<'_>, idx: usize) -> Option<i64> {
    match ctx.get_raw(idx) {
        ValueRef::Integer(n) => Some(n),
        ValueRef::Real(x) => Some(x as i64),
        ValueRef::Text(text) => std::str::from_utf8(text).ok()?.trim().parse().ok(),
        _ => None,
    }
}

fn real_arg(ctx: &Context<'_>, idx: usize) -> Option<f64> {
    match ctx.get_raw(idx) {
        ValueRef::Integer(n) => Some(n as f64),
        ValueRef::Real(x) => Some(x),
        ValueRef::Text(text) => std::str::from_utf8(text).ok()?.trim().parse().ok(),
        _ => None,
    }
}

fn count_arg(ctx: &Context<'_>, idx: usize) -> Option<usize> {
    int_arg(ctx, idx).map(|n| usize::try_from(n).unwrap_or(0))
}

fn too_big() -> SqlError {
    SqlError::SqliteFailure(
        ffi::Error::new(ffi::SQLITE_TOOBIG),
        Some("string or blob too big".to_string()),
    )
}

fn domain_error() -> SqlError {
    SqlError::UserFunctionError("domain error".into())
}

/// Largest string or blob, in bytes, the connection accepts.
fn length_limit(conn: &Connection) -> usize {
    let limit = unsafe { ffi::sqlite3_limit(conn.handle(), ffi::SQLITE_LIMIT_LENGTH, -1) };
    usize::try_from(limit).unwrap_or(0)
}

/// Fails with `SQLITE_TOOBIG` unless `len` is known and within `limit`.
fn check_len(len: Option<usize>, limit: usize) -> rusqlite::Result<()> {
    match len {
        Some(len) if len <= limit => Ok(()),
        _ => Err(too_big()),
    }
}

fn pad(text: &str, width: usize, align: Align, limit: usize) -> rusqlite::Result<String> {
    let len = text.chars().count();
    if len >= width {
        return Ok(text.to_string());
    }
    let fill = width - len;
    check_len(text.len().checked_add(fill), limit)?;
    let (left, right) = match align {
        Align::Left => (fill, 0),
        Align::Right => (0, fill),
        Align::Center => (fill / 2, fill - fill / 2),
    };
    Ok(format!("{}{}{}", " ".repeat(left), text, " ".repeat(right)))
}

fn replicate(text: &str, count: usize, limit: usize) -> rusqlite::Result<String> {
    check_len(text.len().checked_mul(count), limit)?;
    Ok(text.repeat(count))
}

#[derive(Clone, Copy)]
enum Align {
    /// Padding goes on the left.
    Left,
    Right,
    Center,
}

fn proper(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut word_start = true;
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            if word_start {
                out.extend(ch.to_uppercase());
            } else {
                out.extend(ch.to_lowercase());
            }
            word_start = false;
        } else {
            out.push(ch);
            word_start = true;
        }
    }
    out
}

/// 1-based character position of `needle` in `haystack`, searching from
/// character `start` (1-based). 0 when absent.
fn charindex(needle: &str, haystack: &str, start: i64) -> i64 {
    let needle: Vec<char> = needle.chars().collect();
    let haystack: Vec<char> = haystack.chars().collect();
    if needle.is_empty() || needle.len() > haystack.len() {
        return 0;
    }
    let from = usize::try_from(start.saturating_sub(1)).unwrap_or(0);
    (from..=haystack.len() - needle.len())
        .find(|&pos| haystack[pos..pos + needle.len()] == needle[..])
        .map_or(0, |pos| i64::try_from(pos + 1).unwrap_or(0))
}

/// Characters of `text` that also occur in `keep`, in order.
fn strfilter(text: &str, keep: &str) -> String {
    text.chars().filter(|ch| keep.contains(*ch)).collect()
}

/// Integral result of `ceil`/`floor`; reals outside the i64 range stay real.
fn integral(x: f64) -> SqlValue {
    if x >= i64::MIN as f64 && x < i64::MAX as f64 {
        SqlValue::Integer(x as i64)
    } else {
        SqlValue::Real(x)
    }
}

fn register_text_fn<F>(conn: &Connection, name: &str, func: F) -> rusqlite::Result<()>
where
    F: Fn(&str) -> String + Send + 'static,
{
    let func = AssertUnwindSafe(func);
    conn.create_scalar_function(name, 1, deterministic(), move |ctx| {
        Ok(text_arg(ctx, 0).map(|text| (*func)(&text)))
    })
}

fn register_text_count_fn<F>(conn: &Connection, name: &str, func: F) -> rusqlite::Result<()>
where
    F: Fn(&str, usize) -> rusqlite::Result<String> + Send + 'static,
{
    let func = AssertUnwindSafe(func);
    conn.create_scalar_function(name, 2, deterministic(), move |ctx| {
        match (text_arg(ctx, 0), count_arg(ctx, 1)) {
            (Some(text), Some(count)) => (*func)(&text, count).map(Some),
            _ => Ok(None),
        }
    })
}

/// Registers a one-argument real function. NULL in, NULL out; NaN is a domain error.
fn register_real_fn(conn: &Connection, name: &str, func: fn(f64) -> f64) -> rusqlite::Result<()> {
    conn.create_scalar_function(name, 1, deterministic(), move |ctx| {
        let Some(x) = real_arg(ctx, 0) else {
            return Ok(None);
        };
        let result = func(x);
        if result.is_nan() {
            return Err(domain_error());
        }
        Ok(Some(result))
    })
}

fn register_real2_fn(
    conn: &Connection,
    name: &str,
    func: fn(f64, f64) -> f64,
) -> rusqlite::Result<()> {
    conn.create_scalar_function(name, 2, deterministic(), move |ctx| {
        let (Some(a), Some(b)) = (real_arg(ctx, 0), real_arg(ctx, 1)) else {
            return Ok(None);
        };
        let result = func(a, b);
        if result.is_nan() {
            return Err(domain_error());
        }
        Ok(Some(result))
    })
}

fn register_rounding_fn(conn: &Connection, name: &str, func: fn(f64) -> f64) -> rusqlite::Result<()> {
    conn.create_scalar_function(name, 1, deterministic(), move |ctx| {
        Ok(match ctx.get_raw(0) {
            ValueRef::Integer(n) => SqlValue::Integer(n),
            ValueRef::Real(x) => integral(func(x)),
            _ => SqlValue::Null,
        })
    })
}

fn deterministic() -> FunctionFlags {
    FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC
}

const REAL_FNS: &[(&str, fn(f64) -> f64)] = &[
    ("cos", f64::cos),
    ("sin", f64::sin),
    ("tan", f64::tan),
    ("cot", |x: f64| 1.0 / x.tan()),
    ("acos", f64::acos),
    ("asin", f64::asin),
    ("atan", f64::atan),
    ("cosh", f64::cosh),
    ("sinh", f64::sinh),
    ("tanh", f64::tanh),
    ("coth", |x: f64| 1.0 / x.tanh()),
    ("acosh", f64::acosh),
    ("asinh", f64::asinh),
    ("atanh", f64::atanh),
    ("degrees", f64::to_degrees),
    ("radians", f64::to_radians),
    ("exp", f64::exp),
    ("log", f64::ln),
    ("log10", f64::log10),
    ("sqrt", f64::sqrt),
];

/// Registers the functions every session carries, whatever database it opened.
pub(crate) fn register_baseline(conn: &Connection) -> rusqlite::Result<()> {
    let limit = length_limit(conn);
    register_text_fn(conn, "reverse", |text| text.chars().rev().collect())?;
    register_text_fn(conn, "proper", proper)?;
    register_text_count_fn(conn, "padl", move |text, width| {
        pad(text, width, Align::Left, limit)
    })?;
    register_text_count_fn(conn, "padr", move |text, width| {
        pad(text, width, Align::Right, limit)
    })?;
    register_text_count_fn(conn, "padc", move |text, width| {
        pad(text, width, Align::Center, limit)
    })?;
    register_text_count_fn(conn, "leftstr", |text, count| Ok(text.chars().take(count).collect()))?;
    register_text_count_fn(conn, "rightstr", |text, count| {
        let len = text.chars().count();
        Ok(text.chars().skip(len.saturating_sub(count)).collect())
    })?;
    register_text_count_fn(conn, "replicate", move |text, count| replicate(text, count, limit))?;
    conn.create_scalar_function("charindex", 2, deterministic(), |ctx| {
        Ok(match (text_arg(ctx, 0), text_arg(ctx, 1)) {
            (Some(needle), Some(haystack)) => Some(charindex(&needle, &haystack, 1)),
            _ => None,
        })
    })?;
    conn.create_scalar_function("charindex", 3, deterministic(), |ctx| {
        Ok(match (text_arg(ctx, 0), text_arg(ctx, 1)) {
            (Some(needle), Some(haystack)) => {
                Some(charindex(&needle, &haystack, int_arg(ctx, 2).unwrap_or(1)))
            }
            _ => None,
        })
    })?;
    conn.create_scalar_function("strfilter", 2, deterministic(), |ctx| {
        Ok(match (text_arg(ctx, 0), text_arg(ctx, 1)) {
            (Some(text), Some(keep)) => Some(strfilter(&text, &keep)),
            _ => None,
        })
    })?;

    conn.create_scalar_function("pi", 0, deterministic(), |_| Ok(std::f64::consts::PI))?;
    for (name, func) in REAL_FNS {
        register_real_fn(conn, name, *func)?;
    }
    register_real2_fn(conn, "atan2", f64::atan2)?;
    register_real2_fn(conn, "power", f64::powf)?;
    register_rounding_fn(conn, "ceil", f64::ceil)?;
    register_rounding_fn(conn, "floor", f64::floor)?;
    conn.create_scalar_function("sign", 1, deterministic(), |ctx| {
        Ok(match ctx.get_raw(0) {
            ValueRef::Integer(n) => Some(n.signum()),
            ValueRef::Real(x) if x > 0.0 => Some(1),
            ValueRef::Real(x) if x < 0.0 => Some(-1),
            ValueRef::Real(_) => Some(0),
            _ => None,
        })
    })?;
    conn.create_scalar_function("square", 1, deterministic(), |ctx| {
        Ok(match ctx.get_raw(0) {
            ValueRef::Integer(n) => n
                .checked_mul(n)
                .map_or(SqlValue::Real((n as f64) * (n as f64)), SqlValue::Integer),
            ValueRef::Real(x) => SqlValue::Real(x * x),
            _ => SqlValue::Null,
        })
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar(conn: &Connection, sql: &str) -> SqlValue {
        conn.query_row(sql, [], |row| row.get(0)).expect(sql)
    }

    #[test]
    fn baseline_string_helpers() {
        let conn = Connection::open_in_memory().expect("open");
        register_baseline(&conn).expect("register");
        assert_eq!(scalar(&conn, "SELECT reverse('abc')"), SqlValue::Text("cba".into()));
        assert_eq!(scalar(&conn, "SELECT padl('ab', 4)"), SqlValue::Text("  ab".into()));
        assert_eq!(scalar(&conn, "SELECT padr('ab', 4)"), SqlValue::Text("ab  ".into()));
        assert_eq!(scalar(&conn, "SELECT padc('ab', 5)"), SqlValue::Text(" ab  ".into()));
        assert_eq!(scalar(&conn, "SELECT leftstr('hello', 2)"), SqlValue::Text("he".into()));
        assert_eq!(scalar(&conn, "SELECT rightstr('hello', 3)"), SqlValue::Text("llo".into()));
        assert_eq!(scalar(&conn, "SELECT replicate('ab', 3)"), SqlValue::Text("ababab".into()));
        assert_eq!(scalar(&conn, "SELECT proper('hELLO wORLD')"), SqlValue::Text("Hello World".into()));
        assert_eq!(scalar(&conn, "SELECT reverse(NULL)"), SqlValue::Null);
    }

    #[test]
    fn baseline_numeric_helpers() {
        let conn = Connection::open_in_memory().expect("open");
        register_baseline(&conn).expect("register");
        assert_eq!(scalar(&conn, "SELECT sign(-4.5)"), SqlValue::Integer(-1));
        assert_eq!(scalar(&conn, "SELECT sign(0)"), SqlValue::Integer(0));
        assert_eq!(scalar(&conn, "SELECT square(3)"), SqlValue::Integer(9));
        assert_eq!(scalar(&conn, "SELECT square(1.5)"), SqlValue::Real(2.25));
    }

    fn real(value: SqlValue) -> f64 {
        match value {
            SqlValue::Integer(n) => n as f64,
            SqlValue::Real(x) => x,
            other => panic!("not a number: {other:?}"),
        }
    }

    #[test]
    fn contrib_trigonometric_functions() {
        let conn = Connection::open_in_memory().expect("open");
        register_baseline(&conn).expect("register");
        let checks = [
            "abs(3.141592653589793 - pi())",
            "abs(1 - cos(2 * pi()))",
            "abs(0 - sin(pi()))",
            "abs(0 - tan(0))",
            "abs(0 - cot(pi() / 2))",
            "abs(1 - acos(cos(1)))",
            "abs(1 - asin(sin(1)))",
            "abs(1 - atan(tan(1)))",
            "abs(1 - cosh(0))",
            "abs(0 - sinh(0))",
            "abs(0 - (tanh(1) + tanh(-1)))",
            "abs(0 - (coth(1) + coth(-1)))",
            "abs(1 - acosh(cosh(1)))",
            "abs(1 - asinh(sinh(1)))",
            "abs(1 - atanh(tanh(1)))",
            "abs(180 - degrees(pi()))",
            "abs(pi() - radians(180))",
            "abs(pi() / 2 - atan2(1, 0))",
        ];
        for check in checks {
            let sql = format!("SELECT {check} < 0.000001");
            assert_eq!(scalar(&conn, &sql), SqlValue::Integer(1), "{check}");
        }
    }

    #[test]
    fn contrib_math_functions() {
        let conn = Connection::open_in_memory().expect("open");
        register_baseline(&conn).expect("register");
        let cases = [
            ("exp(0)", 1.0),
            ("log(exp(1))", 1.0),
            ("log10(10000)", 4.0),
            ("power(2, 3)", 8.0),
            ("sign(-10) + sign(20)", 0.0),
            ("sqrt(square(16))", 16.0),
            ("ceil(-1.95) + ceil(1.95)", 1.0),
            ("floor(-1.95) + floor(1.95)", -1.0),
        ];
        for (expr, expected) in cases {
            let got = real(scalar(&conn, &format!("SELECT {expr}")));
            assert!((got - expected).abs() < 1e-9, "{expr} = {got}");
        }
        assert_eq!(scalar(&conn, "SELECT ceil(1.2)"), SqlValue::Integer(2));
        assert_eq!(scalar(&conn, "SELECT floor(7)"), SqlValue::Integer(7));
        assert_eq!(scalar(&conn, "SELECT cos(NULL)"), SqlValue::Null);
        let err = conn
            .query_row("SELECT sqrt(-1)", [], |row| row.get::<_, SqlValue>(0))
            .expect_err("negative root");
        assert!(err.to_string().contains("domain error"), "{err}");
    }

    #[test]
    fn contrib_string_functions() {
        let conn = Connection::open_in_memory().expect("open");
        register_baseline(&conn).expect("register");
        let text = |s: &str| SqlValue::Text(s.into());
        let cases = [
            ("replicate('ab', 4)", text("abababab")),
            ("charindex('ab', 'foobarabbarfoo')", SqlValue::Integer(7)),
            ("charindex('ab', 'foobarabbarfoo', 8)", SqlValue::Integer(0)),
            ("leftstr('foobar', 2)", text("fo")),
            ("rightstr('foobar', 2)", text("ar")),
            ("reverse('foobar')", text("raboof")),
            ("proper('fooBar')", text("Foobar")),
            ("padl('foo', 5)", text("  foo")),
            ("padr('foo', 5)", text("foo  ")),
            ("padc('foo', 5)", text(" foo ")),
            ("strfilter('abcba', 'bc')", text("bcb")),
        ];
        for (expr, expected) in cases {
            assert_eq!(scalar(&conn, &format!("SELECT {expr}")), expected, "{expr}");
        }
        assert_eq!(scalar(&conn, "SELECT charindex('é', 'café')"), SqlValue::Integer(4));
        assert_eq!(scalar(&conn, "SELECT charindex('', 'abc')"), SqlValue::Integer(0));
        assert_eq!(scalar(&conn, "SELECT charindex(NULL, 'abc')"), SqlValue::Null);
    }

    #[test]
    fn oversized_results_fail_without_allocating() {
        let conn = Connection::open_in_memory().expect("open");
        register_baseline(&conn).expect("register");
        for sql in [
            "SELECT replicate('ab', 500000000000000)",
            "SELECT padl('x', 9223372036854775807)",
            "SELECT padr('x', 4000000000)",
            "SELECT padc('x', 4000000000)",
        ] {
            let err = conn
                .query_row(sql, [], |row| row.get::<_, SqlValue>(0))
                .expect_err(sql);
            assert!(err.to_string().contains("too big"), "{sql}: {err}");
        }
        assert_eq!(scalar(&conn, "SELECT replicate('ab', 2)"), SqlValue::Text("abab".into()));
    }

    #[test]
    fn user_function_marshals_arguments_and_results() {
        let conn = Connection::open_in_memory().expect("open");
        create_function(&conn, "describe", -1, |args| {
            Ok(Value::Text(
                args.iter().map(Value::type_name).collect::<Vec<_>>().join(","),
            ))
        })
        .expect("register");
        assert_eq!(
            scalar(&conn, "SELECT describe(1, 2.5, 'x', x'00', NULL)"),
            SqlValue::Text("number,number,string,bytes,null".into())
        );
    }

    #[test]
    fn user_function_errors_fail_only_the_call() {
        let conn = Connection::open_in_memory().expect("open");
        create_function(&conn, "boom", 0, |_| Err("kaboom".to_string())).expect("register");
        let err = conn
            .query_row("SELECT boom()", [], |row| row.get::<_, SqlValue>(0))
            .expect_err("must fail");
        assert!(err.to_string().contains("kaboom"), "{err}");
        assert_eq!(scalar(&conn, "SELECT 1"), SqlValue::Integer(1));
    }

    #[test]
    fn unsupported_return_values_become_errors() {
        let conn = Connection::open_in_memory().expect("open");
        create_function(&conn, "weird", 0, |_| {
            Ok(Value::Unsupported(serde_json::json!({"a": 1})))
        })
        .expect("register");
        let err = conn
            .query_row("SELECT weird()", [], |row| row.get::<_, SqlValue>(0))
            .expect_err("must fail");
        assert!(err.to_string().contains("unknown type"), "{err}");
    }
}
