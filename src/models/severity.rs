//! Syslog severity names and their ordering.

/// Severity names by rank: 0 is most severe, 7 least.
pub const LEVELS: [&str; 8] = [
  "emerg", "alert", "crit", "err", "warning", "notice", "info", "debug",
];

/// Rank used in SQL for severities outside the known set; never matches a
/// `min_severity` threshold.
pub const UNRANKED: u8 = 99;

/// Rank of a severity name. `None` for names outside the syslog set.
pub fn rank(severity: &str) -> Option<u8> {
  LEVELS.iter().position(|name| *name == severity).map(|p| p as u8)
}

/// Map a journald `PRIORITY` value ("0".."7") to its severity name.
pub fn from_priority(priority: &str) -> Option<&'static str> {
  priority
    .parse::<usize>()
    .ok()
    .and_then(|p| LEVELS.get(p))
    .copied()
}

/// SQL `CASE` expression mapping a stored severity to its rank.
pub fn rank_case_sql() -> String {
  let mut sql = String::from("CASE severity");
  for (rank, name) in LEVELS.iter().enumerate() {
    sql.push_str(&format!(" WHEN '{name}' THEN {rank}"));
  }
  sql.push_str(&format!(" ELSE {UNRANKED} END"));
  sql
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rank_orders_levels() {
    assert_eq!(rank("emerg"), Some(0));
    assert_eq!(rank("err"), Some(3));
    assert_eq!(rank("debug"), Some(7));
    assert_eq!(rank("verbose"), None);
    assert_eq!(rank("ERR"), None);
  }

  #[test]
  fn priority_maps_to_names() {
    assert_eq!(from_priority("0"), Some("emerg"));
    assert_eq!(from_priority("6"), Some("info"));
    assert_eq!(from_priority("7"), Some("debug"));
    assert_eq!(from_priority("8"), None);
    assert_eq!(from_priority("nope"), None);
  }

  #[test]
  fn case_sql_covers_all_levels() {
    let sql = rank_case_sql();
    for name in LEVELS {
      assert!(sql.contains(&format!("WHEN '{name}'")));
    }
    assert!(sql.ends_with("ELSE 99 END"));
  }
}
