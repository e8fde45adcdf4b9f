//! Small string helpers shared by the command model and the explanation
//! renderer.

use std::time::Duration;

/// Split `source` on `separator`, trim every piece and drop the empty ones.
pub fn split_trimmed(source: &str, separator: char) -> Vec<String> {
    source
        .split(separator)
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alignment {
    Left,
    Right,
}

/// Pad `text` with repetitions of `seed` up to `line_length` columns.
///
/// Text longer than the line is returned untouched.
pub fn pad_string(text: &str, align: Alignment, line_length: usize, seed: &str) -> String {
    if seed.is_empty() || text.len() >= line_length {
        return text.to_string();
    }
    let fill_len = line_length - text.len();
    let filler: String = seed.chars().cycle().take(fill_len).collect();
    match align {
        Alignment::Left => format!("{text}{filler}"),
        Alignment::Right => format!("{filler}{text}"),
    }
}

/// Parse a duration literal such as `"3s"`, `"500ms"` or `"1m30s"`.
///
/// The grammar is a sequence of `<decimal><unit>` terms with units
/// `ns`, `us`, `ms`, `s`, `m`, `h`. Returns `None` for anything else,
/// including a bare number without a unit.
pub fn parse_duration(source: &str) -> Option<Duration> {
    let source = source.trim();
    if source.is_empty() {
        return None;
    }
    let mut total = Duration::ZERO;
    let mut rest = source;
    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(digits_end);
        let value: f64 = number.parse().ok()?;

        let unit_end = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, remainder) = tail.split_at(unit_end);
        let scale = match unit {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return None,
        };
        total += Duration::from_secs_f64(value * scale);
        rest = remainder;
    }
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn split_trims_and_drops_empties() {
        assert_eq!(
            split_trimmed(" echo hi | wc ||  sort ", '|'),
            vec!["echo hi", "wc", "sort"]
        );
        assert_eq!(split_trimmed("  ", '|'), Vec::<String>::new());
    }

    #[test]
    fn pad_left_and_right() {
        assert_eq!(pad_string("[in", Alignment::Left, 8, "-"), "[in-----");
        assert_eq!(pad_string("in]", Alignment::Right, 8, "-"), "-----in]");
        assert_eq!(pad_string("exactly8", Alignment::Left, 8, "-"), "exactly8");
    }

    #[test]
    fn duration_simple_units() {
        assert_eq!(parse_duration("3s"), Some(Duration::from_secs(3)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
    }

    #[test]
    fn duration_compound_and_fractional() {
        assert_eq!(parse_duration("1m30s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("1.5s"), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn duration_rejects_garbage() {
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("10"), None);
        assert_eq!(parse_duration("10 potatoes"), None);
        assert_eq!(parse_duration("s"), None);
    }
}
