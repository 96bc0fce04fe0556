use percent_encoding::percent_decode_str;

/// Longest file name most file systems accept.
pub const MAX_FILE_NAME: usize = 255;
pub const DEFAULT_FILE_NAME: &str = "index.html";

/// Local file name for the last segment of a URL path.
///
/// An empty basename (`/`, `.`) becomes `index.html`; a name that is too
/// long for the file system gets a random one.
pub fn file_name_from_path(path: &str) -> String {
    let segment = path
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .rsplit('/')
        .next()
        .unwrap_or_default();
    let decoded = percent_decode_str(segment).decode_utf8_lossy();
    finalize_name(&sanitize_filename(&decoded))
}

fn finalize_name(name: &str) -> String {
    if name.is_empty() || name == "." || name == ".." {
        return DEFAULT_FILE_NAME.to_string();
    }
    if name.len() > MAX_FILE_NAME {
        // Fallback if the name cannot be stored as-is
        return format!("download_{}", uuid::Uuid::new_v4());
    }
    name.to_string()
}

pub fn sanitize_filename(filename: &str) -> String {
    filename.replace(
        |c: char| c.is_control() || matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'),
        "_",
    )
}

/// Extracts the `filename=` parameter of a `Content-Disposition` value.
///
/// Accepts quoted or bare names, percent-encoded bytes, and parameters with
/// or without whitespace after `;`.
pub fn filename_from_content_disposition(value: &str) -> Option<String> {
    let raw = value.split(';').skip(1).find_map(|param| {
        let (key, val) = param.trim().split_once('=')?;
        key.trim().eq_ignore_ascii_case("filename").then(|| val.trim())
    })?;
    let raw = raw.trim_matches('"').trim_matches('\'');
    if raw.is_empty() {
        return None;
    }
    let decoded = percent_decode_str(raw).decode_utf8_lossy();
    // Some servers send a full path; only the last component is used.
    let base = decoded.rsplit(['/', '\\']).next().unwrap_or_default();
    let name = finalize_name(&sanitize_filename(base));
    (name != DEFAULT_FILE_NAME || base == DEFAULT_FILE_NAME).then_some(name)
}

/// Parses a byte count with an optional `K`/`M`/`G` suffix (powers of 1024).
pub fn parse_size(value: &str) -> Result<u64, String> {
    let value = value.trim();
    let (digits, multiplier) = match value.chars().last().map(|c| c.to_ascii_uppercase()) {
        Some('K') => (&value[..value.len() - 1], 1024),
        Some('M') => (&value[..value.len() - 1], 1024 * 1024),
        Some('G') => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value, 1),
    };
    let base: u64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("invalid size '{value}'"))?;
    base.checked_mul(multiplier)
        .ok_or_else(|| format!("size '{value}' is too large"))
}

/// Average rate in KB/s, as printed on the completion line.
pub fn rate_kbps(bytes: u64, secs: f64) -> f64 {
    if secs <= 0.0 {
        return bytes as f64 / 1024.0;
    }
    bytes as f64 / 1024.0 / secs
}
