//! Shell escaping and quoting utilities.

/// Escape a value for use inside single quotes.
/// Replaces `'` with `'\''` (end quote, escaped quote, start quote).
pub fn escape_single_quote_content(value: &str) -> String {
    value.replace('\'', "'\\''")
}

/// Quote a single argument for shell execution.
/// - Empty strings become `''`
/// - Strings with shell metacharacters are wrapped in single quotes
/// - Embedded single quotes are escaped
pub fn quote_arg(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }

    const SHELL_META: &[char] = &[
        ' ', '\t', '\n', '\'', '"', '\\', '$', '`', '!', '*', '?', '[', ']', '(', ')', '{', '}',
        '<', '>', '|', '&', ';', '#', '~',
    ];

    if !arg.contains(SHELL_META) {
        return arg.to_string();
    }

    format!("'{}'", escape_single_quote_content(arg))
}

/// Quote a path for shell execution (always quotes).
pub fn quote_path(path: &str) -> String {
    format!("'{}'", escape_single_quote_content(path))
}

/// Wrap a complete command so it can be handed to `sh -c` as one argument.
pub fn escape_command_for_shell(command: &str) -> String {
    format!("'{}'", escape_single_quote_content(command))
}

/// Prefix a command with an explicit working directory.
///
/// Remote commands never rely on session state from a previous call, so every
/// invocation carries its own `cd`.
pub fn in_dir(dir: &str, command: &str) -> String {
    format!("cd {} && {}", quote_path(dir), command)
}

/// Join two remote path segments with exactly one `/` between them.
pub fn join_remote(base: &str, child: &str) -> String {
    let base = base.trim_end_matches('/');
    let child = child.trim_start_matches('/');
    if base.is_empty() {
        format!("/{}", child)
    } else if child.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, child)
    }
}

/// Parent directory of a remote path, or `None` for single-segment paths.
pub fn remote_parent(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    let idx = trimmed.rfind('/')?;
    if idx == 0 {
        return None;
    }
    Some(&trimmed[..idx])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_arg_simple() {
        assert_eq!(quote_arg("migrate"), "migrate");
        assert_eq!(quote_arg("command=proxy"), "command=proxy");
    }

    #[test]
    fn quote_arg_with_spaces() {
        assert_eq!(quote_arg("hello world"), "'hello world'");
    }

    #[test]
    fn quote_arg_with_single_quote() {
        assert_eq!(quote_arg("it's"), "'it'\\''s'");
    }

    #[test]
    fn quote_arg_empty() {
        assert_eq!(quote_arg(""), "''");
    }

    #[test]
    fn quote_path_with_quote() {
        assert_eq!(quote_path("/var/www/it's"), "'/var/www/it'\\''s'");
    }

    #[test]
    fn in_dir_quotes_directory() {
        assert_eq!(in_dir("/var/www/app", "ls"), "cd '/var/www/app' && ls");
    }

    #[test]
    fn join_remote_normalizes_slashes() {
        assert_eq!(join_remote("/var/www/", "/releases"), "/var/www/releases");
        assert_eq!(join_remote("/var/www", "shared/config/conf.php"), "/var/www/shared/config/conf.php");
        assert_eq!(join_remote("", "tmp"), "/tmp");
    }

    #[test]
    fn remote_parent_of_nested_file() {
        assert_eq!(remote_parent("/srv/shared/config/conf.php"), Some("/srv/shared/config"));
        assert_eq!(remote_parent("/srv"), None);
        assert_eq!(remote_parent("config/conf.php"), Some("config"));
    }
}
