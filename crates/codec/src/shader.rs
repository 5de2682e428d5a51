//! GLSL sources, read by a line scan rather than a compiler.

use crate::Decoded;
use crate::error::{ErrorKind, Result};
use wold_metadata::models::{ShaderAttributes, ShaderType};

pub const FORMATS: &[&str] = &["glsl", "vert", "frag", "geom", "comp", "tesc", "tese", "vs", "fs", "gs", "cs"];

const QUALIFIERS: &[&str] = &[
    "flat", "smooth", "noperspective", "centroid", "sample", "patch", "invariant", "precise", "highp", "mediump", "lowp",
];

pub fn decode(bytes: &[u8], format: &str) -> Result<Decoded<ShaderAttributes>> {
    let source = std::str::from_utf8(bytes).map_err(|_| ErrorKind::malformed("shader: not UTF-8"))?;
    Ok(Decoded::new(scan(source, ShaderType::from_extension(format))))
}

/// Declarations, version and outputs of a shader. `hint` (usually from the
/// file extension) wins over the stage guessed from the source.
pub fn scan(source: &str, hint: Option<ShaderType>) -> ShaderAttributes {
    let shader_type = hint.or_else(|| infer_type(source));
    let mut attrs = ShaderAttributes {
        shader_type,
        has_vertex_output: source.contains("gl_Position"),
        has_fragment_output: source.contains("gl_FragColor") || source.contains("gl_FragData"),
        ..Default::default()
    };
    for line in source.lines().map(code) {
        if let Some(version) = line.strip_prefix("#version") {
            attrs.glsl_version.get_or_insert_with(|| version.trim().to_string());
            continue;
        }
        let Some((keyword, names)) = declaration(line) else {
            continue;
        };
        match (keyword, shader_type) {
            ("uniform", _) => attrs.uniforms.extend(names),
            ("attribute", _) | ("in", Some(ShaderType::Vertex) | None) => attrs.attributes.extend(names),
            ("out", Some(ShaderType::Fragment)) => attrs.has_fragment_output = true,
            _ => attrs.varyings.extend(names),
        }
    }
    attrs
}

fn infer_type(source: &str) -> Option<ShaderType> {
    if source.contains("local_size_x") {
        Some(ShaderType::Compute)
    } else if source.contains("EmitVertex") {
        Some(ShaderType::Geometry)
    } else if source.contains("gl_TessLevel") {
        Some(ShaderType::Tessellation)
    } else if source.contains("gl_Position") {
        Some(ShaderType::Vertex)
    } else if source.contains("gl_FragColor") || source.contains("gl_FragCoord") || source.contains("gl_FragData") {
        Some(ShaderType::Fragment)
    } else {
        None
    }
}

/// A line with its `//` comment removed, trimmed.
fn code(line: &str) -> &str {
    line.split("//").next().unwrap_or_default().trim()
}

/// `(keyword, names)` for a global `uniform`/`attribute`/`varying`/`in`/`out`
/// declaration. Uniform blocks report the block name.
fn declaration(line: &str) -> Option<(&str, Vec<String>)> {
    let mut rest = line;
    if rest.starts_with("layout") {
        rest = &rest[rest.find(')')? + 1..];
    }
    let mut tokens = rest.split_whitespace();
    let keyword = loop {
        let token = tokens.next()?;
        if !QUALIFIERS.contains(&token) {
            break token;
        }
    };
    if !matches!(keyword, "uniform" | "attribute" | "varying" | "in" | "out") {
        return None;
    }
    let remainder: Vec<&str> = tokens.collect();
    let remainder = remainder.join(" ");
    if remainder.contains('{') {
        let block = remainder.split(|c: char| c == '{' || c.is_whitespace()).next()?.trim();
        return (!block.is_empty()).then(|| (keyword, vec![block.to_string()]));
    }
    if remainder.contains('(') {
        return None;
    }
    let body = remainder.split(';').next()?;
    // Skip the type, which can be qualified further (`highp vec3`).
    let mut words = body.split_whitespace().skip_while(|w| QUALIFIERS.contains(w));
    words.next()?;
    let names: Vec<String> = words
        .collect::<Vec<_>>()
        .join(" ")
        .split(',')
        .filter_map(|n| {
            let n = n.split('=').next()?.split('[').next()?.trim();
            (!n.is_empty()).then(|| n.to_string())
        })
        .collect();
    (!names.is_empty()).then_some((keyword, names))
}

/// Problems a shader registry should warn about; none of them stop
/// registration.
pub fn check(source: &str, attrs: &ShaderAttributes) -> Vec<String> {
    let mut warnings = Vec::new();
    if source.trim().is_empty() {
        warnings.push("shader source is empty".to_string());
        return warnings;
    }
    if !source.contains("main") {
        warnings.push("no main function".to_string());
    }
    match attrs.shader_type {
        Some(ShaderType::Vertex) if !attrs.has_vertex_output => {
            warnings.push("vertex shader never writes gl_Position".to_string())
        },
        Some(ShaderType::Fragment) if !attrs.has_fragment_output => {
            warnings.push("fragment shader has no color output".to_string())
        },
        _ => {},
    }
    warnings
}

/// Drop `//` comments, trailing whitespace and blank lines.
pub fn strip(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    for line in source.lines() {
        let kept = line.split("//").next().unwrap_or_default().trim_end();
        if !kept.trim().is_empty() {
            out.push_str(kept);
            out.push('\n');
        }
    }
    out
}
