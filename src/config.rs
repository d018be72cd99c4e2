use serde::{Deserialize, Serialize};

/// Engine-wide options, as recognized by the §6 query surface.
///
/// Parsing the options file or command line that produces this struct is out
/// of scope here (owned by an outer CLI/HTTP layer); this module only owns
/// the in-core representation and its documented defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `Sprintf`-style format for floating point cells, e.g. `"%.15g"`.
    /// Empty string means "use the driver's default textual representation".
    pub double_format: String,

    /// Emit numeric dimension/attribute ids instead of enum codes on CSV output.
    pub is_id_csv: bool,

    /// Pack CSV output tree into a zip archive (handled by an outer packaging layer).
    pub zip_output: bool,

    /// Directory under which CSV/zip output is written.
    pub output_dir: String,

    /// Database connection string passed to the selected driver.
    pub db_connection: String,

    /// Selects the [`crate::facet::DialectFacet`] used to generate SQL: `"sqlite"`,
    /// `"mysql"`, or `"postgres"`.
    pub db_driver: String,

    /// Enable microdata endpoints; microdata reads are otherwise rejected.
    pub is_microdata: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            double_format: String::new(),
            is_id_csv: false,
            zip_output: false,
            output_dir: String::new(),
            db_connection: String::new(),
            db_driver: String::new(),
            is_microdata: false,
        }
    }
}
