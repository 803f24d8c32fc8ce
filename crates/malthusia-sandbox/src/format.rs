//! Textual renderings: `repr`, `str` and f-string format specs.

use std::rc::Rc;

use crate::error::{RaiseError, VmResult};
use crate::ops::ensure_materializable;
use crate::value::Value;

/// Largest precision a format spec may request.
pub const MAX_PRECISION: usize = 1_000;

/// `repr(value)`.
pub fn repr(value: &Value) -> String {
    let mut out = String::new();
    write_repr(value, &mut Vec::new(), &mut out);
    out
}

/// `str(value)`.
pub fn to_str(value: &Value) -> String {
    match value {
        Value::Str(s) => s.to_string(),
        Value::Exception(e) => e.message(),
        _ => repr(value),
    }
}

/// Containers currently being rendered, to cut self-references short.
type Seen = Vec<*const ()>;

fn enter(seen: &mut Seen, ptr: *const ()) -> bool {
    if seen.contains(&ptr) {
        return false;
    }
    seen.push(ptr);
    true
}

fn write_repr(value: &Value, seen: &mut Seen, out: &mut String) {
    match value {
        Value::None => out.push_str("None"),
        Value::Bool(true) => out.push_str("True"),
        Value::Bool(false) => out.push_str("False"),
        Value::Int(i) => out.push_str(&i.to_string()),
        Value::Float(f) => out.push_str(&float_repr(*f)),
        Value::Str(s) => out.push_str(&quote(s)),
        Value::List(items) => {
            if !enter(seen, Rc::as_ptr(items) as *const ()) {
                out.push_str("[...]");
                return;
            }
            out.push('[');
            write_items(&items.borrow(), seen, out);
            out.push(']');
            seen.pop();
        }
        Value::Tuple(items) => {
            out.push('(');
            write_items(items, seen, out);
            if items.len() == 1 {
                out.push(',');
            }
            out.push(')');
        }
        Value::Dict(map) => {
            if !enter(seen, Rc::as_ptr(map) as *const ()) {
                out.push_str("{...}");
                return;
            }
            out.push('{');
            for (i, (k, v)) in map.borrow().iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_repr(k.value(), seen, out);
                out.push_str(": ");
                write_repr(v, seen, out);
            }
            out.push('}');
            seen.pop();
        }
        Value::Set(set) => {
            let set = set.borrow();
            if set.is_empty() {
                out.push_str("set()");
                return;
            }
            out.push('{');
            for (i, k) in set.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_repr(k.value(), seen, out);
            }
            out.push('}');
        }
        Value::Range(r) => {
            if r.step == 1 {
                out.push_str(&format!("range({}, {})", r.start, r.stop));
            } else {
                out.push_str(&format!("range({}, {}, {})", r.start, r.stop, r.step));
            }
        }
        Value::Slice(s) => {
            let part = |p: Option<i64>| p.map_or_else(|| "None".to_string(), |i| i.to_string());
            out.push_str(&format!(
                "slice({}, {}, {})",
                part(s.start),
                part(s.stop),
                part(s.step)
            ));
        }
        Value::Iter(_) => out.push_str("<iterator object>"),
        Value::Function(f) => out.push_str(&format!("<function {}>", f.code.name)),
        Value::Builtin(b) => out.push_str(&format!("<built-in function {}>", b.name)),
        Value::Method(m) => out.push_str(&format!(
            "<built-in method {} of {} object>",
            m.def.name,
            m.receiver.type_name()
        )),
        Value::UnboundMethod(def) => {
            out.push_str(&format!("<method '{}' of '{}' objects>", def.name, def.owner))
        }
        Value::Detached(inner) => write_repr(inner, seen, out),
        Value::Module(m) => out.push_str(&format!("<module '{}'>", m.name)),
        Value::Type(kind) => out.push_str(&format!("<class '{}'>", kind.name())),
        Value::ExcType(kind) => out.push_str(&format!("<class '{}'>", kind.name())),
        Value::Exception(e) => {
            out.push_str(e.kind.name());
            out.push('(');
            write_items(&e.args, seen, out);
            out.push(')');
        }
        Value::Code(unit) => out.push_str(&format!("<code object {}>", unit.name)),
        Value::Null => out.push_str("<NULL>"),
    }
}

fn write_items(items: &[Value], seen: &mut Seen, out: &mut String) {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        write_repr(item, seen, out);
    }
}

/// Single quotes unless the text contains one and no double quote.
fn quote(s: &str) -> String {
    let delim = if s.contains('\'') && !s.contains('"') { '"' } else { '\'' };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(delim);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == delim => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                out.push_str(&format!("\\x{:02x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push(delim);
    out
}

/// Shortest round-tripping rendering, in scientific form outside `[1e-4, 1e16)`.
pub fn float_repr(f: f64) -> String {
    if f.is_nan() {
        return "nan".into();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf".into() } else { "-inf".into() };
    }
    let magnitude = f.abs();
    if magnitude != 0.0 && !(1e-4..1e16).contains(&magnitude) {
        let sci = format!("{f:e}");
        let (mantissa, exponent) = sci.split_once('e').unwrap_or((&sci, "0"));
        let exponent: i32 = exponent.parse().unwrap_or(0);
        let sign = if exponent < 0 { '-' } else { '+' };
        return format!("{mantissa}e{sign}{:02}", exponent.abs());
    }
    if f.fract() == 0.0 {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Format Specs
// ══════════════════════════════════════════════════════════════════════════════

/// `format(value, spec)`: `[[fill]align][sign][0][width][.precision][type]`.
pub fn format_value(value: &Value, spec: &str) -> VmResult<String> {
    if spec.is_empty() {
        return Ok(to_str(value));
    }
    let invalid = || RaiseError::value_error(format!("Invalid format specifier '{spec}'"));
    let chars: Vec<char> = spec.chars().collect();
    let mut i = 0;

    let is_align = |c: char| matches!(c, '<' | '>' | '^' | '=');
    let mut fill = ' ';
    let mut align = None;
    if chars.len() >= 2 && is_align(chars[1]) {
        fill = chars[0];
        align = Some(chars[1]);
        i = 2;
    } else if is_align(chars[0]) {
        align = Some(chars[0]);
        i = 1;
    }

    let mut sign = '-';
    if let Some(&c @ ('+' | '-' | ' ')) = chars.get(i) {
        sign = c;
        i += 1;
    }
    if chars.get(i) == Some(&'0') {
        if align.is_none() {
            fill = '0';
            align = Some('=');
        }
        i += 1;
    }
    let width = take_number(&chars, &mut i);
    let precision = if chars.get(i) == Some(&'.') {
        i += 1;
        Some(take_number(&chars, &mut i).ok_or_else(invalid)?)
    } else {
        None
    };
    let kind = chars.get(i).copied();
    if kind.is_some() {
        i += 1;
    }
    if i != chars.len() {
        return Err(invalid());
    }
    if precision.is_some_and(|p| p > MAX_PRECISION) {
        return Err(RaiseError::value_error(format!(
            "precision too big (limit {MAX_PRECISION})"
        )));
    }
    if let Some(width) = width {
        ensure_materializable(width)?;
    }

    let numeric = value.as_float().is_some();
    let body = match kind {
        None if precision.is_some() && numeric => {
            fixed(value.as_float().unwrap_or(0.0), precision.unwrap_or(6))
        }
        None | Some('s') => {
            if kind == Some('s') && numeric {
                return Err(invalid());
            }
            let text = to_str(value);
            match precision {
                Some(p) => text.chars().take(p).collect(),
                None => text,
            }
        }
        Some('d') => match value.as_int() {
            Some(n) => n.to_string(),
            None => return Err(invalid()),
        },
        Some(c @ ('x' | 'X' | 'o' | 'b')) => {
            let n = value.as_int().ok_or_else(invalid)?;
            let digits = match c {
                'x' => format!("{:x}", n.unsigned_abs()),
                'X' => format!("{:X}", n.unsigned_abs()),
                'o' => format!("{:o}", n.unsigned_abs()),
                _ => format!("{:b}", n.unsigned_abs()),
            };
            if n < 0 {
                format!("-{digits}")
            } else {
                digits
            }
        }
        Some('f' | 'F') => fixed(value.as_float().ok_or_else(invalid)?, precision.unwrap_or(6)),
        Some('e') => {
            let f = value.as_float().ok_or_else(invalid)?;
            let sci = format!("{:.*e}", precision.unwrap_or(6), f);
            let (mantissa, exponent) = sci.split_once('e').unwrap_or((&sci, "0"));
            let exponent: i32 = exponent.parse().unwrap_or(0);
            let exp_sign = if exponent < 0 { '-' } else { '+' };
            format!("{mantissa}e{exp_sign}{:02}", exponent.abs())
        }
        Some('%') => {
            let f = value.as_float().ok_or_else(invalid)?;
            format!("{}%", fixed(f * 100.0, precision.unwrap_or(6)))
        }
        Some(_) => return Err(invalid()),
    };

    let body = if numeric && sign != '-' && !body.starts_with('-') {
        format!("{sign}{body}")
    } else {
        body
    };
    let default_align = if numeric { '>' } else { '<' };
    Ok(pad(&body, fill, align.unwrap_or(default_align), width.unwrap_or(0)))
}

fn take_number(chars: &[char], i: &mut usize) -> Option<usize> {
    let start = *i;
    while chars.get(*i).is_some_and(|c| c.is_ascii_digit()) {
        *i += 1;
    }
    if start == *i {
        return None;
    }
    // Overlong digit runs saturate so the ceilings reject them.
    Some(chars[start..*i].iter().collect::<String>().parse().unwrap_or(usize::MAX))
}

fn fixed(f: f64, precision: usize) -> String {
    if f.is_nan() {
        "nan".into()
    } else if f.is_infinite() {
        if f > 0.0 { "inf".into() } else { "-inf".into() }
    } else {
        format!("{f:.precision$}")
    }
}

fn pad(body: &str, fill: char, align: char, width: usize) -> String {
    let len = body.chars().count();
    if len >= width {
        return body.to_string();
    }
    let gap = width - len;
    let fill_n = |n: usize| std::iter::repeat(fill).take(n).collect::<String>();
    match align {
        '<' => format!("{body}{}", fill_n(gap)),
        '^' => format!("{}{body}{}", fill_n(gap / 2), fill_n(gap - gap / 2)),
        '=' => match body.strip_prefix(['-', '+', ' ']) {
            Some(rest) => format!("{}{}{rest}", &body[..1], fill_n(gap)),
            None => format!("{}{body}", fill_n(gap)),
        },
        _ => format!("{}{body}", fill_n(gap)),
    }
}
