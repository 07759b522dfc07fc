//! Built-in scalar helpers: casing, date, currency, and conditional blocks.
//!
//! Helpers write straight to the output stream, so anything that is not
//! deliberate markup must be escaped here before it is written.

use handlebars::{
    Context, Handlebars, Helper, HelperDef, HelperResult, Output, RenderContext, Renderable,
    html_escape,
};
use serde_json::Value as Json;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime};

/// Render a scalar parameter the way template interpolation would.
pub(crate) fn scalar_text(value: &Json) -> String {
    match value {
        Json::Null => String::new(),
        Json::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn param_text(h: &Helper<'_>, index: usize) -> Option<String> {
    h.param(index).map(|param| scalar_text(param.value()))
}

#[derive(Clone, Copy)]
pub(crate) struct UpperHelper;

impl HelperDef for UpperHelper {
    fn call<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
        out: &mut dyn Output,
    ) -> HelperResult {
        let text = param_text(h, 0).unwrap_or_default();
        out.write(&html_escape(&text.to_uppercase()))?;
        Ok(())
    }
}

#[derive(Clone, Copy)]
pub(crate) struct LowerHelper;

impl HelperDef for LowerHelper {
    fn call<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
        out: &mut dyn Output,
    ) -> HelperResult {
        let text = param_text(h, 0).unwrap_or_default();
        out.write(&html_escape(&text.to_lowercase()))?;
        Ok(())
    }
}

/// `{{formatDate value fmt?}}` with a .NET-style custom format string.
/// Unparseable input renders as the empty string.
#[derive(Clone, Copy)]
pub(crate) struct FormatDateHelper;

impl HelperDef for FormatDateHelper {
    fn call<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
        out: &mut dyn Output,
    ) -> HelperResult {
        let raw = param_text(h, 0).unwrap_or_default();
        let format = param_text(h, 1).unwrap_or_else(|| "d".to_string());

        if let Some(timestamp) = parse_timestamp(&raw) {
            out.write(&html_escape(&format_date(timestamp, &format)))?;
        }
        Ok(())
    }
}

fn parse_timestamp(text: &str) -> Option<OffsetDateTime> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    if let Ok(parsed) = OffsetDateTime::parse(text, &Rfc3339) {
        return Some(parsed);
    }

    let date_time_t = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
    if let Ok(parsed) = PrimitiveDateTime::parse(text, date_time_t) {
        return Some(parsed.assume_utc());
    }

    let date_time_space = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    if let Ok(parsed) = PrimitiveDateTime::parse(text, date_time_space) {
        return Some(parsed.assume_utc());
    }

    let date_only = format_description!("[year]-[month]-[day]");
    if let Ok(parsed) = Date::parse(text, date_only) {
        return Some(parsed.midnight().assume_utc());
    }

    let date_slashed = format_description!("[day]/[month]/[year]");
    if let Ok(parsed) = Date::parse(text, date_slashed) {
        return Some(parsed.midnight().assume_utc());
    }

    None
}

/// Expand the supported .NET custom date tokens. The single-character
/// format `"d"` is the short-date form.
fn format_date(timestamp: OffsetDateTime, format: &str) -> String {
    if format == "d" {
        return format!(
            "{:02}/{:02}/{:04}",
            timestamp.day(),
            u8::from(timestamp.month()),
            timestamp.year()
        );
    }

    let bytes = format.as_bytes();
    let mut output = String::with_capacity(format.len() + 8);
    let mut index = 0;

    while index < bytes.len() {
        let token = bytes[index];
        let run = bytes[index..].iter().take_while(|b| **b == token).count();
        let consumed = match token {
            b'y' if run >= 4 => {
                output.push_str(&format!("{:04}", timestamp.year()));
                4
            }
            b'y' if run >= 2 => {
                output.push_str(&format!("{:02}", timestamp.year().rem_euclid(100)));
                2
            }
            b'M' if run >= 4 => {
                output.push_str(&timestamp.month().to_string());
                4
            }
            b'M' if run == 3 => {
                output.push_str(&timestamp.month().to_string()[..3]);
                3
            }
            b'M' if run == 2 => {
                output.push_str(&format!("{:02}", u8::from(timestamp.month())));
                2
            }
            b'd' if run >= 2 => {
                output.push_str(&format!("{:02}", timestamp.day()));
                2
            }
            b'd' => {
                output.push_str(&timestamp.day().to_string());
                1
            }
            b'H' if run >= 2 => {
                output.push_str(&format!("{:02}", timestamp.hour()));
                2
            }
            b'm' if run >= 2 => {
                output.push_str(&format!("{:02}", timestamp.minute()));
                2
            }
            b's' if run >= 2 => {
                output.push_str(&format!("{:02}", timestamp.second()));
                2
            }
            other => {
                output.push(other as char);
                1
            }
        };
        index += consumed;
    }

    output
}

/// `{{currency value culture?}}`; unknown cultures silently fall back to
/// en-GB, unparseable amounts render as the empty string.
#[derive(Clone, Copy)]
pub(crate) struct CurrencyHelper;

impl HelperDef for CurrencyHelper {
    fn call<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
        out: &mut dyn Output,
    ) -> HelperResult {
        let amount = match h.param(0).and_then(|param| parse_amount(param.value())) {
            Some(amount) => amount,
            None => return Ok(()),
        };
        let culture = param_text(h, 1).unwrap_or_default();

        out.write(&html_escape(&format_currency(amount, &culture)))?;
        Ok(())
    }
}

fn parse_amount(value: &Json) -> Option<f64> {
    match value {
        Json::Number(number) => number.as_f64(),
        Json::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

struct CultureFormat {
    symbol: &'static str,
    decimal_sep: &'static str,
    group_sep: &'static str,
    decimals: usize,
    symbol_leads: bool,
    symbol_spaced: bool,
}

const EN_GB: CultureFormat = CultureFormat {
    symbol: "\u{a3}",
    decimal_sep: ".",
    group_sep: ",",
    decimals: 2,
    symbol_leads: true,
    symbol_spaced: false,
};

fn culture_format(code: &str) -> CultureFormat {
    match code {
        "en-US" | "en-CA" | "en-AU" | "en-NZ" => CultureFormat {
            symbol: "$",
            ..EN_GB
        },
        "en-IE" => CultureFormat {
            symbol: "\u{20ac}",
            ..EN_GB
        },
        "de-DE" | "es-ES" | "it-IT" => CultureFormat {
            symbol: "\u{20ac}",
            decimal_sep: ",",
            group_sep: ".",
            decimals: 2,
            symbol_leads: false,
            symbol_spaced: true,
        },
        "fr-FR" => CultureFormat {
            symbol: "\u{20ac}",
            decimal_sep: ",",
            group_sep: "\u{a0}",
            decimals: 2,
            symbol_leads: false,
            symbol_spaced: true,
        },
        "nl-NL" => CultureFormat {
            symbol: "\u{20ac}",
            decimal_sep: ",",
            group_sep: ".",
            decimals: 2,
            symbol_leads: true,
            symbol_spaced: true,
        },
        "ja-JP" => CultureFormat {
            symbol: "\u{a5}",
            decimals: 0,
            ..EN_GB
        },
        _ => EN_GB,
    }
}

fn format_currency(amount: f64, culture: &str) -> String {
    let style = culture_format(culture);
    let negative = amount.is_sign_negative() && amount != 0.0;
    let fixed = format!("{:.*}", style.decimals, amount.abs());
    let (integral, fraction) = match fixed.split_once('.') {
        Some((integral, fraction)) => (integral, Some(fraction)),
        None => (fixed.as_str(), None),
    };

    let mut grouped = String::with_capacity(fixed.len() + 4);
    for (offset, digit) in integral.chars().enumerate() {
        if offset > 0 && (integral.len() - offset) % 3 == 0 {
            grouped.push_str(style.group_sep);
        }
        grouped.push(digit);
    }
    if let Some(fraction) = fraction {
        grouped.push_str(style.decimal_sep);
        grouped.push_str(fraction);
    }

    let space = if style.symbol_spaced { "\u{a0}" } else { "" };
    let body = if style.symbol_leads {
        format!("{}{}{}", style.symbol, space, grouped)
    } else {
        format!("{}{}{}", grouped, space, style.symbol)
    };

    if negative { format!("-{body}") } else { body }
}

/// `{{#ifEquals a b}} ... {{else}} ... {{/ifEquals}}` comparing the two
/// parameters by their string renditions.
#[derive(Clone, Copy)]
pub(crate) struct IfEqualsHelper;

impl HelperDef for IfEqualsHelper {
    fn call<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        r: &'reg Handlebars<'reg>,
        ctx: &'rc Context,
        rc: &mut RenderContext<'reg, 'rc>,
        out: &mut dyn Output,
    ) -> HelperResult {
        let left = param_text(h, 0).unwrap_or_default();
        let right = param_text(h, 1).unwrap_or_default();

        let branch = if left == right {
            h.template()
        } else {
            h.inverse()
        };
        if let Some(template) = branch {
            template.render(r, ctx, rc, out)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn short_date_format_is_day_month_year() {
        let stamp = datetime!(2024-03-05 10:30:00 UTC);
        assert_eq!(format_date(stamp, "d"), "05/03/2024");
    }

    #[test]
    fn custom_tokens_expand() {
        let stamp = datetime!(2024-03-05 09:07:02 UTC);
        assert_eq!(format_date(stamp, "yyyy-MM-dd"), "2024-03-05");
        assert_eq!(format_date(stamp, "d MMM yyyy"), "5 Mar 2024");
        assert_eq!(format_date(stamp, "dd MMMM yyyy"), "05 March 2024");
        assert_eq!(format_date(stamp, "HH:mm:ss"), "09:07:02");
        assert_eq!(format_date(stamp, "dd/MM/yy"), "05/03/24");
    }

    #[test]
    fn timestamps_parse_from_common_shapes() {
        assert!(parse_timestamp("2024-03-05T10:30:00Z").is_some());
        assert!(parse_timestamp("2024-03-05T10:30:00").is_some());
        assert!(parse_timestamp("2024-03-05 10:30:00").is_some());
        assert!(parse_timestamp("2024-03-05").is_some());
        assert!(parse_timestamp("05/03/2024").is_some());
        assert!(parse_timestamp("not a date").is_none());
        assert!(parse_timestamp("").is_none());
    }

    #[test]
    fn currency_defaults_to_en_gb() {
        assert_eq!(format_currency(9.99, ""), "\u{a3}9.99");
        assert_eq!(format_currency(9.99, "en-GB"), "\u{a3}9.99");
    }

    #[test]
    fn currency_groups_thousands() {
        assert_eq!(format_currency(1234567.5, "en-GB"), "\u{a3}1,234,567.50");
        assert_eq!(format_currency(1234.5, "de-DE"), "1.234,50\u{a0}\u{20ac}");
    }

    #[test]
    fn currency_handles_negatives_and_yen() {
        assert_eq!(format_currency(-9.99, "en-US"), "-$9.99");
        assert_eq!(format_currency(1200.0, "ja-JP"), "\u{a5}1,200");
    }

    #[test]
    fn unknown_culture_falls_back_silently() {
        assert_eq!(format_currency(5.0, "xx-XX"), "\u{a3}5.00");
    }
}
