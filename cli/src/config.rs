use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

pub struct Config {
    pub db_path: PathBuf,
    pub samples_path: PathBuf,
    pub data_dir: PathBuf,
}

impl Config {
    /// Resolve the data directory, creating it on first use. `samples`
    /// overrides the default health sample file.
    pub fn load(samples: Option<PathBuf>) -> Result<Self> {
        let proj_dirs =
            ProjectDirs::from("", "", "daybook").context("Could not determine home directory")?;

        let data_dir = proj_dirs.data_dir().to_path_buf();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        Ok(Self::in_dir(data_dir, samples))
    }

    fn in_dir(data_dir: PathBuf, samples: Option<PathBuf>) -> Self {
        let db_path = data_dir.join("daybook.db");
        let samples_path = samples.unwrap_or_else(|| data_dir.join("health_samples.json"));
        Config {
            db_path,
            samples_path,
            data_dir,
        }
    }

    /// Load the API key from disk, or generate a new one.
    ///
    /// Returns `(key, newly_created)`.
    pub fn load_or_create_api_key(&self) -> Result<(String, bool)> {
        let path = self.data_dir.join("api_key");

        if path.exists() {
            let key = std::fs::read_to_string(&path).context("Failed to read API key file")?;
            let key = key.trim().to_string();
            if !key.is_empty() {
                return Ok((key, false));
            }
        }

        let key = generate_api_key();
        write_private(&path, &key)?;
        eprintln!("Generated new API key: {key}");
        eprintln!("Include in requests: Authorization: Bearer {key}");
        Ok((key, true))
    }
}

fn generate_api_key() -> String {
    use rand::Rng;
    use std::fmt::Write;

    let bytes: [u8; 32] = rand::rng().random();
    bytes
        .iter()
        .fold(String::with_capacity(64), |mut acc: String, b| {
            let _ = write!(acc, "{b:02x}");
            acc
        })
}

fn write_private(path: &Path, contents: &str) -> Result<()> {
    std::fs::write(path, contents).context("Failed to write API key file")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .context("Failed to set API key file permissions")?;
    }
    Ok(())
}
