use clap::Args;

use super::validators::{validate_limit, validate_owner};

/// List stored records for one owner.
#[derive(Debug, Args)]
pub struct RecordsArgs {
    #[arg(long, value_parser = validate_owner)]
    pub owner: String,
    /// Maximum number of records to print.
    #[arg(long, value_parser = validate_limit)]
    pub limit: Option<usize>,
}
