/// Checks a subscription filter against MQTT 3.1.1 wildcard rules.
pub fn validate_filter(filter: &str) -> Result<(), String> {
    if filter.is_empty() {
        return Err("topic filter must not be empty".into());
    }
    if filter.contains('\0') {
        return Err(format!("topic filter {:?} contains NUL", filter));
    }

    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != levels.len() - 1) {
            return Err(format!("'#' must be the last whole level in {:?}", filter));
        }
        if level.contains('+') && *level != "+" {
            return Err(format!("'+' must occupy a whole level in {:?}", filter));
        }
    }
    Ok(())
}

/// Whether a concrete topic is covered by a (valid) filter.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    // `$SYS`-style topics are not matched by leading wildcards.
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
