//! Gauge name parsing: display names and units

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

const COUNTER_SUFFIX: &str = "[counter]";

static UNIT_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (
            r"java\.lang:type=Memory:(Non)?HeapMemoryUsage/(init|used|committed|max)",
            "bytes",
        ),
        (
            r"java\.lang:type=OperatingSystem:(Free|Total)(Physical|Swap)MemorySize",
            "bytes",
        ),
        (r"java\.lang:type=Runtime:Uptime", "milliseconds"),
        (
            r"java\.lang:type=Threading:CurrentThread(Cpu|User)Time",
            "nanoseconds",
        ),
        (
            r"java\.lang:type=MemoryPool,name=[a-zA-Z0-9 ]+:(Peak)?Usage/(init|used|committed|max)",
            "bytes",
        ),
        (
            r"java\.lang:type=GarbageCollector,name=[a-zA-Z0-9 ]+:LastGcInfo/duration",
            "milliseconds",
        ),
        (
            r"java\.lang:type=GarbageCollector,name=[a-zA-Z0-9 ]+:CollectionTime",
            "milliseconds",
        ),
        (
            r"java\.lang:type=Compilation:TotalCompilationTime",
            "milliseconds",
        ),
    ]
    .into_iter()
    .filter_map(|(pattern, unit)| {
        Regex::new(&format!("^(?:{pattern})$"))
            .ok()
            .map(|regex| (regex, unit))
    })
    .collect()
});

/// A gauge as presented in notifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gauge {
    /// Full gauge name, e.g. `java.lang:type=Memory:HeapMemoryUsage/used`
    pub name: String,
    /// Human readable name, e.g. `java.lang/Memory/HeapMemoryUsage/used`
    pub display: String,
    /// Whether the value is a per-second rate derived from a counter
    pub counter: bool,
    /// Unit shown after values, e.g. `bytes`
    pub unit: Option<String>,
}

impl Gauge {
    /// Parse `mbean:attribute[counter]`
    pub fn parse(gauge_name: &str) -> Self {
        let (object_name, attribute) = match gauge_name.rsplit_once(':') {
            Some((object_name, attribute)) => (Some(object_name), attribute),
            None => (None, gauge_name),
        };
        let (attribute, counter) = match attribute.strip_suffix(COUNTER_SUFFIX) {
            Some(attribute) => (attribute, true),
            None => (attribute, false),
        };
        let display = match object_name {
            Some(object_name) => format!("{}/{attribute}", display_object_name(object_name)),
            None => attribute.to_string(),
        };

        let base_name = gauge_name
            .strip_suffix(COUNTER_SUFFIX)
            .unwrap_or(gauge_name);
        let base_unit = UNIT_PATTERNS
            .iter()
            .find(|(pattern, _)| pattern.is_match(base_name))
            .map(|(_, unit)| *unit);
        let unit = match (base_unit, counter) {
            (Some(unit), true) => Some(format!("{unit} per second")),
            (None, true) => Some("per second".to_string()),
            (Some(unit), false) => Some(unit.to_string()),
            (None, false) => None,
        };

        Self {
            name: gauge_name.to_string(),
            display,
            counter,
            unit,
        }
    }
}

/// `java.lang:name=PS Eden Space,type=MemoryPool` becomes `java.lang/PS Eden Space/MemoryPool`
fn display_object_name(object_name: &str) -> String {
    let mut parts = object_name.split([':', ',']);
    let mut display = parts.next().unwrap_or_default().to_string();
    for part in parts {
        display.push('/');
        display.push_str(part.split_once('=').map_or(part, |(_, value)| value));
    }
    display
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[test]
    fn test_parse_counter_gauge() {
        let gauge = Gauge::parse(
            "java.lang:type=GarbageCollector,name=PS Scavenge:CollectionTime[counter]",
        );
        assert_eq!(
            gauge,
            Gauge {
                name: "java.lang:type=GarbageCollector,name=PS Scavenge:CollectionTime[counter]"
                    .to_string(),
                display: "java.lang/GarbageCollector/PS Scavenge/CollectionTime".to_string(),
                counter: true,
                unit: Some("milliseconds per second".to_string()),
            }
        );
    }

    #[rstest]
    #[case("java.lang:type=Memory:HeapMemoryUsage/used", Some("bytes"))]
    #[case("java.lang:type=Memory:NonHeapMemoryUsage/max", Some("bytes"))]
    #[case("java.lang:type=Runtime:Uptime", Some("milliseconds"))]
    #[case("java.lang:type=Threading:CurrentThreadCpuTime", Some("nanoseconds"))]
    #[case("java.lang:type=MemoryPool,name=PS Old Gen:PeakUsage/committed", Some("bytes"))]
    #[case("java.lang:type=Compilation:TotalCompilationTime", Some("milliseconds"))]
    #[case("javaxlang:type=Runtime:Uptime", None)]
    #[case("java.lang:type=Runtime:UptimeExtra", None)]
    #[case("com.example:type=Cache:Size[counter]", Some("per second"))]
    fn test_units(#[case] gauge_name: &str, #[case] unit: Option<&str>) {
        assert_eq!(Gauge::parse(gauge_name).unit.as_deref(), unit);
    }

    #[test]
    fn test_display() {
        assert_eq!(
            Gauge::parse("java.lang:type=Memory:HeapMemoryUsage/used").display,
            "java.lang/Memory/HeapMemoryUsage/used"
        );
        assert_eq!(Gauge::parse("plain").display, "plain");
    }
}
