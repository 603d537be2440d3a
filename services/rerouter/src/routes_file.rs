//! Routes file loading.
//!
//! The file is a TOML document with one `[[route]]` table per route:
//!
//! ```toml
//! [[route]]
//! name = "web"
//! listen_port = 8080
//! target_host = "10.0.0.5"
//! target_port = "80"
//! ```

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

use crate::proxy::RouteDescriptor;

#[derive(Debug, Default, Deserialize)]
struct RoutesFile {
    #[serde(default)]
    route: Vec<RouteDescriptor>,
}

/// Parse route descriptors from TOML text, in file order.
pub fn parse(content: &str) -> Result<Vec<RouteDescriptor>> {
    let file: RoutesFile = toml::from_str(content).context("Invalid routes file")?;
    Ok(file.route)
}

/// Read and parse a routes file.
pub fn load(path: &Path) -> Result<Vec<RouteDescriptor>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read routes file: {}", path.display()))?;

    let routes = parse(&content)
        .with_context(|| format!("Failed to parse routes file: {}", path.display()))?;

    info!(
        path = %path.display(),
        route_count = routes.len(),
        "Loaded routes file"
    );

    Ok(routes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::PortValue;
    use std::io::Write;

    #[test]
    fn test_load_routes_in_order() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[[route]]
name = "web"
listen_ip = "0.0.0.0"
listen_port = 8080
target_host = "10.0.0.5"
target_port = "80"

[[route]]
listenPort = "2222"
"#
        )
        .unwrap();

        let routes = load(file.path()).unwrap();

        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].name.as_deref(), Some("web"));
        assert_eq!(routes[0].target_port, Some(PortValue::Text("80".to_string())));
        assert_eq!(routes[1], RouteDescriptor::new("2222"));
    }

    #[test]
    fn test_empty_file_has_no_routes() {
        assert!(parse("").unwrap().is_empty());
    }

    #[test]
    fn test_missing_listen_port_is_rejected() {
        let err = parse("[[route]]\ntarget_host = \"10.0.0.5\"\n").unwrap_err();
        assert!(err.to_string().contains("Invalid routes file"));
    }

    #[test]
    fn test_missing_file_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");

        let err = load(&path).unwrap_err();
        assert!(err.to_string().contains("absent.toml"));
    }
}
