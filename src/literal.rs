use crate::ast::Constant;
use crate::error::ConvertError;
use regex::Regex;
use std::sync::LazyLock;

static STRING_PREFIX: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r#"^(?P<prefix>[A-Za-z]*)(?P<quote>'''|"""|'|")"#));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringPrefix {
    pub raw: bool,
    pub bytes: bool,
    pub formatted: bool,
    pub open_len: usize,
    pub close_len: usize,
}

pub fn string_prefix(literal: &str) -> Result<StringPrefix, ConvertError> {
    let re = STRING_PREFIX.as_ref().map_err(|err| err.clone())?;
    let caps = re
        .captures(literal)
        .ok_or_else(|| ConvertError::malformed("string", format!("unquoted literal {literal:?}")))?;
    let prefix = caps["prefix"].to_ascii_lowercase();
    let quote = &caps["quote"];
    Ok(StringPrefix {
        raw: prefix.contains('r'),
        bytes: prefix.contains('b'),
        formatted: prefix.contains('f'),
        open_len: caps["prefix"].len() + quote.len(),
        close_len: quote.len(),
    })
}

// Named escapes (`\N{...}`) are kept as written.
pub fn decode_escapes(raw: &str) -> String {
    let chars: Vec<char> = raw.chars().collect();
    let mut out = String::with_capacity(raw.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        i += 1;
        if c != '\\' {
            out.push(c);
            continue;
        }
        let Some(&esc) = chars.get(i) else {
            out.push('\\');
            break;
        };
        i += 1;
        match esc {
            '\n' => {}
            '\r' => {
                if chars.get(i) == Some(&'\n') {
                    i += 1;
                }
            }
            '\\' => out.push('\\'),
            '\'' => out.push('\''),
            '"' => out.push('"'),
            'a' => out.push('\u{07}'),
            'b' => out.push('\u{08}'),
            'f' => out.push('\u{0c}'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            'v' => out.push('\u{0b}'),
            '0'..='7' => {
                let mut value = esc.to_digit(8).unwrap_or(0);
                let mut taken = 1;
                while taken < 3 {
                    match chars.get(i).and_then(|d| d.to_digit(8)) {
                        Some(d) => {
                            value = value * 8 + d;
                            i += 1;
                            taken += 1;
                        }
                        None => break,
                    }
                }
                out.extend(char::from_u32(value));
            }
            'x' | 'u' | 'U' => {
                let width = match esc {
                    'x' => 2,
                    'u' => 4,
                    _ => 8,
                };
                match hex_value(&chars[i..], width).and_then(char::from_u32) {
                    Some(decoded) => {
                        out.push(decoded);
                        i += width;
                    }
                    None => {
                        out.push('\\');
                        out.push(esc);
                    }
                }
            }
            other => {
                out.push('\\');
                out.push(other);
            }
        }
    }
    out
}

fn hex_value(chars: &[char], width: usize) -> Option<u32> {
    if chars.len() < width {
        return None;
    }
    chars[..width]
        .iter()
        .try_fold(0u32, |acc, c| Some(acc * 16 + c.to_digit(16)?))
}

pub fn unescape_braces(text: &str) -> String {
    text.replace("{{", "{").replace("}}", "}")
}

pub fn parse_number(text: &str) -> Constant {
    let cleaned: String = text.chars().filter(|c| *c != '_').collect();
    if cleaned.ends_with(['j', 'J']) {
        return Constant::Complex(text.to_string());
    }
    let lower = cleaned.to_ascii_lowercase();
    let lower = lower.trim_end_matches('l');
    let radix_digits = [("0x", 16), ("0o", 8), ("0b", 2)]
        .iter()
        .find_map(|(prefix, radix)| lower.strip_prefix(prefix).map(|rest| (rest, *radix)));
    if let Some((digits, radix)) = radix_digits {
        return parse_int(digits, radix, text);
    }
    if lower.contains(['.', 'e']) {
        return match lower.parse::<f64>() {
            Ok(value) => Constant::Float(value),
            Err(_) => Constant::Complex(text.to_string()),
        };
    }
    parse_int(lower, 10, text)
}

fn parse_int(digits: &str, radix: u32, original: &str) -> Constant {
    if let Ok(value) = i64::from_str_radix(digits, radix) {
        return Constant::Int(value);
    }
    match u128::from_str_radix(digits, radix) {
        Ok(value) => Constant::BigInt(value.to_string()),
        Err(_) if radix == 10 => Constant::BigInt(digits.trim_start_matches('0').to_string()),
        Err(_) => Constant::BigInt(original.to_string()),
    }
}
