use arbor_types::ClientError;

/// Resolves `path` against `working_directory` into an absolute path with
/// no `.`, `..`, or empty components.
///
/// Relative paths require an absolute working directory, and `..` may not
/// climb above `/`.
pub fn canonicalize(path: &str, working_directory: &str) -> Result<String, ClientError> {
    let mut components: Vec<&str> = Vec::new();
    let relative = !path.is_empty() && !path.starts_with('/');
    let base = if relative {
        if !working_directory.starts_with('/') {
            return Err(ClientError::InvalidArgument(format!(
                "Can't use relative path '{path}' from working directory '{working_directory}' \
                 (working directory should be an absolute path)"
            )));
        }
        working_directory
    } else {
        ""
    };
    for component in base.split('/').chain(path.split('/')) {
        match component {
            "" | "." => {}
            ".." => {
                if components.pop().is_none() {
                    return Err(ClientError::InvalidArgument(format!(
                        "Path '{path}' from working directory '{working_directory}' attempts \
                         to look up directory above root ('/')"
                    )));
                }
            }
            name => components.push(name),
        }
    }
    Ok(format!("/{}", components.join("/")))
}
