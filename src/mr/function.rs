//! The built-in map/reduce applications, selectable by name from the
//! worker command line.

use super::worker::KeyValue;

pub type MapFn = fn(&str) -> Vec<KeyValue>;
pub type ReduceFn = fn(&str, &[String]) -> String;

/// A user-supplied pair of pure functions. Both must be deterministic:
/// redundant executions of the same task overwrite each other's files and
/// are only harmless if they produce identical bytes.
#[derive(Clone, Copy)]
pub struct Application {
    pub name: &'static str,
    pub map: MapFn,
    pub reduce: ReduceFn,
}

pub fn lookup(name: &str) -> Option<Application> {
    match name {
        "wc" => Some(Application { name: "wc", map: wc::map, reduce: wc::reduce }),
        _ => None,
    }
}

/// Word count.
pub mod wc {
    use super::KeyValue;

    pub fn map(contents: &str) -> Vec<KeyValue> {
        contents
            .split_whitespace()
            .map(|word| KeyValue::new(word.to_string(), "1".to_string()))
            .collect()
    }

    pub fn reduce(_key: &str, values: &[String]) -> String {
        values.len().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wc_map_emits_one_pair_per_word() {
        let pairs = wc::map("foo bar  foo\n");
        let keys: Vec<&str> = pairs.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["foo", "bar", "foo"]);
        assert!(pairs.iter().all(|kv| kv.value == "1"));
    }

    #[test]
    fn wc_reduce_counts_occurrences() {
        let values = vec!["1".to_string(), "1".to_string(), "1".to_string()];
        assert_eq!(wc::reduce("foo", &values), "3");
    }

    #[test]
    fn lookup_knows_wc_and_nothing_else() {
        assert!(lookup("wc").is_some());
        assert!(lookup("grep").is_none());
    }
}
