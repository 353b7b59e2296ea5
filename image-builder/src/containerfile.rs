//! Containerfile rendering.
//!
//! The rendered file performs the same sequence as the local provisioner,
//! with the three installer commands chained by `&&` in a single layer so a
//! failure anywhere stops the build.

use std::path::Path;

use crate::config::ProvisionConfig;
use crate::error::{ProvisionError, ProvisionResult};
use crate::mirror::MirrorConfig;

/// Render a Containerfile for `config`.
///
/// Source paths in `COPY` are made relative to `context`, the directory
/// passed to the container build.
pub fn render(config: &ProvisionConfig, context: &Path) -> ProvisionResult<String> {
    config.validate()?;

    let base = config.base()?;
    let mirror = config.mirror()?;
    let workdir = config.workdir.display().to_string();
    let manifest_target = config.manifest_target().display().to_string();
    let payload_target = config.payload_target()?.display().to_string();
    let manifest_source = context_relative(&config.sources.manifest, context)?;
    let payload_source = context_relative(&config.sources.payload, context)?;

    let lines = [
        format!("FROM {}", base),
        String::new(),
        format!("ENV {}={}", config.search_path_var, env_value(&workdir)),
        format!("WORKDIR {}", workdir),
        format!("RUN mkdir -p {}", shell_quote(&payload_target)),
        String::new(),
        copy_instruction(&manifest_source, &manifest_target)?,
        copy_instruction(&payload_source, &payload_target)?,
        String::new(),
        format!(
            "RUN {}",
            install_chain(config, &mirror, &shell_quote(&manifest_target))
        ),
    ];

    let mut out = lines.join("\n");
    out.push('\n');
    Ok(out)
}

/// `COPY` in exec form, which keeps paths with spaces intact
fn copy_instruction(source: &str, target: &str) -> ProvisionResult<String> {
    Ok(format!(
        "COPY [{}, {}]",
        serde_json::to_string(source)?,
        serde_json::to_string(target)?
    ))
}

fn is_plain(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+:=@%,".contains(c))
}

/// Quote an `ENV` value when it is not a single plain word
fn env_value(value: &str) -> String {
    if is_plain(value) {
        return value.to_string();
    }
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}

/// Quote a word for `/bin/sh`
fn shell_quote(value: &str) -> String {
    if is_plain(value) {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn install_chain(config: &ProvisionConfig, mirror: &MirrorConfig, manifest: &str) -> String {
    let installer = config.installer.command_line();
    let cache = if config.installer.no_cache {
        " --no-cache-dir"
    } else {
        ""
    };
    format!(
        "{} \\\n    && {} install{} -r {} \\\n    && {} install{} --upgrade {}",
        mirror.config_command(&installer),
        installer,
        cache,
        manifest,
        installer,
        cache,
        config.installer.force_upgrade
    )
}

fn context_relative(source: &Path, context: &Path) -> ProvisionResult<String> {
    let relative = source.strip_prefix(context).map_err(|_| {
        ProvisionError::InvalidConfig(format!(
            "'{}' is outside the build context '{}'",
            source.display(),
            context.display()
        ))
    })?;
    if relative.as_os_str().is_empty() {
        return Ok(".".to_string());
    }
    // Containerfiles use forward slashes on every platform.
    Ok(relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config() -> ProvisionConfig {
        ProvisionConfig::default()
            .with_base_image("python:3.10")
            .with_mirror_url("https://pypi.tuna.tsinghua.edu.cn/simple")
            .resolve_sources(Path::new("/project"))
    }

    #[test]
    fn test_render_default_layout() {
        let rendered = render(&config(), Path::new("/project")).unwrap();
        let expected = "\
FROM python:3.10

ENV PYTHONPATH=/workspace
WORKDIR /workspace
RUN mkdir -p /workspace/api

COPY [\"requirements.txt\", \"/workspace/requirements.txt\"]
COPY [\"api\", \"/workspace/api\"]

RUN pip config set global.index-url https://pypi.tuna.tsinghua.edu.cn/simple \\
    && pip install --no-cache-dir -r /workspace/requirements.txt \\
    && pip install --no-cache-dir --upgrade transformers
";
        assert_eq!(rendered, expected);
    }

    #[test]
    fn test_render_is_deterministic() {
        let first = render(&config(), Path::new("/project")).unwrap();
        let second = render(&config(), Path::new("/project")).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_mirror_configured_before_installs() {
        let rendered = render(&config(), Path::new("/project")).unwrap();
        let mirror = rendered.find("config set global.index-url").unwrap();
        let bulk = rendered.find("-r /workspace/requirements.txt").unwrap();
        let upgrade = rendered.find("--upgrade transformers").unwrap();
        assert!(mirror < bulk && bulk < upgrade);
    }

    #[test]
    fn test_sources_outside_context_rejected() {
        let config = config().with_payload(PathBuf::from("/elsewhere/api"));
        let result = render(&config, Path::new("/project"));
        assert!(matches!(result, Err(ProvisionError::InvalidConfig(_))));
    }

    #[test]
    fn test_nested_sources() {
        let config = ProvisionConfig::default()
            .with_manifest("/project/deploy/requirements.txt")
            .with_payload("/project/src/api");
        let rendered = render(&config, Path::new("/project")).unwrap();
        assert!(rendered.contains(r#"COPY ["deploy/requirements.txt", "/workspace/requirements.txt"]"#));
        assert!(rendered.contains(r#"COPY ["src/api", "/workspace/api"]"#));
    }

    #[test]
    fn test_paths_with_spaces_are_quoted() {
        let config = ProvisionConfig::default()
            .with_workdir("/srv/my app")
            .with_manifest("/project/deploy files/requirements.txt")
            .with_payload("/project/src/my api");
        let rendered = render(&config, Path::new("/project")).unwrap();

        assert!(rendered.contains("ENV PYTHONPATH=\"/srv/my app\"\n"));
        assert!(rendered.contains("WORKDIR /srv/my app\n"));
        assert!(rendered.contains("RUN mkdir -p '/srv/my app/my api'\n"));
        assert!(rendered.contains(
            r#"COPY ["deploy files/requirements.txt", "/srv/my app/requirements.txt"]"#
        ));
        assert!(rendered.contains(r#"COPY ["src/my api", "/srv/my app/my api"]"#));
        assert!(rendered.contains("-r '/srv/my app/requirements.txt'"));
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("/workspace/api"), "/workspace/api");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(env_value(r#"a "b""#), r#""a \"b\"""#);
    }
}
