//! SVG-emitting helpers: QR and Code-128 barcodes.
//!
//! These write raw markup, so they must never pass through HTML escaping.

use handlebars::{
    Context, Handlebars, Helper, HelperDef, HelperResult, Output, RenderContext, html_escape,
};
use qrcode::render::svg;
use qrcode::{EcLevel, QrCode};

use super::helpers::scalar_text;

const DEFAULT_DARK: &str = "#000000";
const DEFAULT_LIGHT: &str = "transparent";
const DEFAULT_BAR_HEIGHT: f64 = 60.0;
const QR_MODULE_PIXELS: u32 = 10;
const BAR_MODULE_PIXELS: f64 = 2.0;

fn param_text(h: &Helper<'_>, index: usize) -> Option<String> {
    h.param(index).map(|param| scalar_text(param.value()))
}

/// `{{qrCode value dark? light?}}`: inline SVG QR, ECC level M, no quiet
/// zone. A `transparent` background is emitted as `fill="none"`.
#[derive(Clone, Copy)]
pub(crate) struct QrCodeHelper;

impl HelperDef for QrCodeHelper {
    fn call<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
        out: &mut dyn Output,
    ) -> HelperResult {
        let value = param_text(h, 0).unwrap_or_default();
        if value.is_empty() {
            return Ok(());
        }
        let dark = param_text(h, 1).filter(|text| !text.is_empty());
        let light = param_text(h, 2).filter(|text| !text.is_empty());

        if let Some(markup) = qr_code_svg(
            &value,
            dark.as_deref().unwrap_or(DEFAULT_DARK),
            light.as_deref().unwrap_or(DEFAULT_LIGHT),
        ) {
            out.write(&markup)?;
        }
        Ok(())
    }
}

pub(crate) fn qr_code_svg(value: &str, dark: &str, light: &str) -> Option<String> {
    let code = QrCode::with_error_correction_level(value.as_bytes(), EcLevel::M).ok()?;
    let markup = code
        .render::<svg::Color<'_>>()
        .quiet_zone(false)
        .module_dimensions(QR_MODULE_PIXELS, QR_MODULE_PIXELS)
        .dark_color(svg::Color(dark))
        .light_color(svg::Color(light))
        .build();

    // Keep only the inline element; the renderer prefixes an XML prolog.
    let markup = match markup.find("<svg") {
        Some(start) => markup[start..].to_string(),
        None => markup,
    };

    if light.eq_ignore_ascii_case("transparent") {
        Some(markup.replace("fill=\"transparent\"", "fill=\"none\""))
    } else {
        Some(markup)
    }
}

/// `{{barCode value height? showText? dark?}}`: inline SVG Code-128.
#[derive(Clone, Copy)]
pub(crate) struct BarCodeHelper;

impl HelperDef for BarCodeHelper {
    fn call<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
        out: &mut dyn Output,
    ) -> HelperResult {
        let value = param_text(h, 0).unwrap_or_default();
        let height = param_text(h, 1)
            .and_then(|text| text.trim().parse::<f64>().ok())
            .filter(|height| *height > 0.0)
            .unwrap_or(DEFAULT_BAR_HEIGHT);
        let show_text = param_text(h, 2)
            .map(|text| text.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let dark = param_text(h, 3)
            .filter(|text| !text.is_empty())
            .unwrap_or_else(|| DEFAULT_DARK.to_string());

        if let Some(markup) = bar_code_svg(&value, height, show_text, &dark) {
            out.write(&markup)?;
        }
        Ok(())
    }
}

// Code 128 symbology: module-width patterns for values 0..=105 plus the
// stop pattern at index 106.
const CODE128_PATTERNS: [&str; 107] = [
    "212222", "222122", "222221", "121223", "121322", "131222", "122213", "122312", "132212",
    "221213", "221312", "231212", "112232", "122132", "122231", "113222", "123122", "123221",
    "223211", "221132", "221231", "213212", "223112", "312131", "311222", "321122", "321221",
    "312212", "322112", "322211", "212123", "212321", "232121", "111323", "131123", "131321",
    "112313", "132113", "132311", "211313", "231113", "231311", "112133", "112331", "132131",
    "113123", "113321", "133121", "313121", "211331", "231131", "213113", "213311", "213131",
    "311123", "311321", "331121", "312113", "312311", "332111", "314111", "221411", "431111",
    "111224", "111422", "121124", "121421", "141122", "141221", "112214", "112412", "122114",
    "122411", "142112", "142211", "241211", "221114", "413111", "241112", "134111", "111242",
    "121142", "121241", "114212", "124112", "124211", "411212", "421112", "421211", "212141",
    "214121", "412121", "111143", "111341", "131141", "114113", "114311", "411113", "411311",
    "113141", "114131", "311141", "411131", "211412", "211214", "211232", "2331112",
];

const START_B: u8 = 104;
const START_C: u8 = 105;
const STOP: u8 = 106;

/// Symbol values including start, checksum, and stop. Digit-only payloads
/// of even length use character set C, everything else set B. Input must
/// stay within printable ASCII.
fn code128_values(value: &str) -> Option<Vec<u8>> {
    if value.is_empty() || !value.bytes().all(|byte| (0x20..=0x7e).contains(&byte)) {
        return None;
    }

    let mut values = Vec::with_capacity(value.len() + 3);
    let digits_only =
        value.len() >= 4 && value.len() % 2 == 0 && value.bytes().all(|byte| byte.is_ascii_digit());

    if digits_only {
        values.push(START_C);
        for pair in value.as_bytes().chunks(2) {
            values.push((pair[0] - b'0') * 10 + (pair[1] - b'0'));
        }
    } else {
        values.push(START_B);
        for byte in value.bytes() {
            values.push(byte - 0x20);
        }
    }

    let checksum: u32 = values[0] as u32
        + values
            .iter()
            .enumerate()
            .skip(1)
            .map(|(weight, symbol)| weight as u32 * *symbol as u32)
            .sum::<u32>();
    values.push((checksum % 103) as u8);
    values.push(STOP);
    Some(values)
}

pub(crate) fn bar_code_svg(value: &str, height: f64, show_text: bool, dark: &str) -> Option<String> {
    let symbols = code128_values(value)?;

    let mut bars: Vec<(f64, f64)> = Vec::new();
    let mut cursor = 0.0;
    for symbol in &symbols {
        let pattern = CODE128_PATTERNS[*symbol as usize];
        for (position, width_digit) in pattern.bytes().enumerate() {
            let width = (width_digit - b'0') as f64 * BAR_MODULE_PIXELS;
            if position % 2 == 0 {
                bars.push((cursor, width));
            }
            cursor += width;
        }
    }

    let total_width = cursor;
    let text_block = if show_text { 16.0 } else { 0.0 };
    let total_height = height + text_block;

    let mut markup = format!(
        "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"{total_width}\" \
         height=\"{total_height}\" viewBox=\"0 0 {total_width} {total_height}\" \
         shape-rendering=\"crispEdges\">"
    );
    for (x, width) in bars {
        markup.push_str(&format!(
            "<rect x=\"{x}\" y=\"0\" width=\"{width}\" height=\"{height}\" fill=\"{dark}\"/>"
        ));
    }
    if show_text {
        markup.push_str(&format!(
            "<text x=\"{}\" y=\"{}\" text-anchor=\"middle\" font-family=\"monospace\" \
             font-size=\"12\" fill=\"{dark}\">{}</text>",
            total_width / 2.0,
            height + 12.0,
            html_escape(value)
        ));
    }
    markup.push_str("</svg>");
    Some(markup)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charset_b_values_carry_the_expected_checksum() {
        // 104 + 1*33 + 2*34 + 3*35 = 310; 310 mod 103 = 1
        assert_eq!(
            code128_values("ABC"),
            Some(vec![104, 33, 34, 35, 1, 106])
        );
    }

    #[test]
    fn even_digit_runs_use_charset_c() {
        // 105 + 1*12 + 2*34 = 185; 185 mod 103 = 82
        assert_eq!(code128_values("1234"), Some(vec![105, 12, 34, 82, 106]));
    }

    #[test]
    fn non_printable_input_is_rejected() {
        assert!(code128_values("caf\u{e9}").is_none());
        assert!(code128_values("").is_none());
    }

    #[test]
    fn barcode_svg_uses_the_dark_colour() {
        let markup = bar_code_svg("ABC123", 60.0, false, "#112233").expect("markup");
        assert!(markup.starts_with("<svg"));
        assert!(markup.contains("fill=\"#112233\""));
        assert!(!markup.contains("<text"));
    }

    #[test]
    fn barcode_text_is_opt_in_and_escaped() {
        let markup = bar_code_svg("A<B", 40.0, true, "#000000").expect("markup");
        assert!(markup.contains("<text"));
        assert!(markup.contains("A&lt;B"));
    }

    #[test]
    fn qr_svg_is_inline_markup() {
        let markup = qr_code_svg("https://example.test/r/1", "#000000", "transparent")
            .expect("markup");
        assert!(markup.starts_with("<svg"));
        assert!(markup.contains("viewBox"));
        assert!(!markup.contains("fill=\"transparent\""));
    }

    #[test]
    fn qr_svg_keeps_custom_colours() {
        let markup = qr_code_svg("hello", "#1a2b3c", "#ffffff").expect("markup");
        assert!(markup.contains("#1a2b3c"));
        assert!(markup.contains("#ffffff"));
    }
}
