use crate::paths::normalize_folder;

/// Validate worker count: must be between 1 and 64.
pub fn validate_workers(s: &str) -> Result<usize, String> {
    let value = s
        .parse::<usize>()
        .map_err(|_| format!("invalid number: {}", s))?;

    if value == 0 {
        return Err("workers must be at least 1".to_string());
    }

    if value > 64 {
        return Err("workers cannot exceed 64".to_string());
    }

    Ok(value)
}

/// Validate listing limit: must be between 1 and 1000.
pub fn validate_limit(s: &str) -> Result<usize, String> {
    let value = s
        .parse::<usize>()
        .map_err(|_| format!("invalid number: {}", s))?;

    if value == 0 {
        return Err("limit must be at least 1".to_string());
    }

    if value > 1000 {
        return Err("limit cannot exceed 1000".to_string());
    }

    Ok(value)
}

/// Validate blob folder: lowercase ASCII letters, digits, `-` and `_`, length 1..=64.
pub fn validate_folder(s: &str) -> Result<String, String> {
    normalize_folder(s).map_err(|err| err.to_string())
}

/// Owner ids are opaque; only blank input is refused.
pub fn validate_owner(s: &str) -> Result<String, String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err("owner cannot be empty".to_string());
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workers_bounds() {
        assert_eq!(validate_workers("8"), Ok(8));
        assert!(validate_workers("0").is_err());
        assert!(validate_workers("65").is_err());
        assert!(validate_workers("many").is_err());
    }

    #[test]
    fn folder_is_normalized() {
        assert_eq!(validate_folder(" User_Images "), Ok("user_images".to_string()));
        assert!(validate_folder("../etc").is_err());
    }

    #[test]
    fn owner_is_trimmed_and_otherwise_opaque() {
        assert_eq!(validate_owner(" u1 "), Ok("u1".to_string()));
        assert_eq!(validate_owner("org/42"), Ok("org/42".to_string()));
        assert!(validate_owner("  ").is_err());
    }
}
