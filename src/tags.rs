use regex::Regex;
use std::cmp::Ordering;
use std::sync::LazyLock;
use tracing::debug;

static VERSION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^([0-9]+(?:\.[0-9]+)*)(?:-([0-9A-Za-z~-]+(?:\.[0-9A-Za-z~-]+)*)|([A-Za-z~-][0-9A-Za-z~-]*(?:\.[0-9A-Za-z~-]+)*))?(?:\+[0-9A-Za-z~-]+(?:\.[0-9A-Za-z~-]+)*)?$",
    )
    .unwrap()
});

/// Keeps the tags matching `pattern`. An empty pattern keeps everything.
pub fn filter_by_regex(tags: Vec<String>, pattern: &str) -> Result<Vec<String>, regex::Error> {
    if pattern.is_empty() {
        return Ok(tags);
    }
    let regex = Regex::new(pattern)?;
    let total = tags.len();
    let filtered: Vec<String> = tags.into_iter().filter(|tag| regex.is_match(tag)).collect();
    debug!(
        "Filtered {} tags to {} with regex {}",
        total,
        filtered.len(),
        pattern
    );
    Ok(filtered)
}

struct VersionTag<'a> {
    tag: &'a str,
    stripped: &'a str,
    version: TagVersion,
}

impl VersionTag<'_> {
    fn has_suffix(&self) -> bool {
        self.stripped.contains('-')
    }
}

/// Highest version first. Tags that are not versions are dropped.
///
/// Equal versions prefer the tag without a `-suffix`, then the lexicographically greater tag.
pub fn sort_version_descending(tags: &[String]) -> Vec<String> {
    let mut versions: Vec<VersionTag> = tags
        .iter()
        .filter_map(|tag| {
            let stripped = tag.strip_prefix('v').unwrap_or(tag);
            TagVersion::parse(stripped).map(|version| VersionTag {
                tag,
                stripped,
                version,
            })
        })
        .collect();

    versions.sort_by(compare_version_tags);
    versions.into_iter().map(|v| v.tag.to_string()).collect()
}

fn compare_version_tags(a: &VersionTag, b: &VersionTag) -> Ordering {
    b.version
        .cmp(&a.version)
        .then_with(|| a.has_suffix().cmp(&b.has_suffix()))
        .then_with(|| b.stripped.cmp(a.stripped))
        .then_with(|| b.tag.cmp(a.tag))
}

/// Reverse lexicographic order over every tag.
pub fn sort_alphabetical_descending(tags: &[String]) -> Vec<String> {
    let mut sorted = tags.to_vec();
    sorted.sort_by(|a, b| b.cmp(a));
    sorted
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum PreIdentifier {
    Numeric(u64),
    Alpha(String),
}

/// Any number of numeric segments, an optional prerelease and ignored build metadata.
///
/// Missing segments compare as zero, so `1.2` equals `1.2.0` and `1.2.3.1` is above `1.2.3`.
/// The prerelease may follow the segments directly when it starts with a letter (`1.2.3alpine`).
#[derive(Debug, Clone)]
struct TagVersion {
    segments: Vec<u64>,
    pre: Vec<PreIdentifier>,
}

impl TagVersion {
    fn parse(s: &str) -> Option<Self> {
        let caps = VERSION_REGEX.captures(s)?;
        let segments = caps[1]
            .split('.')
            .map(|segment| segment.parse().ok())
            .collect::<Option<Vec<u64>>>()?;
        let pre = caps
            .get(2)
            .or_else(|| caps.get(3))
            .map(|pre| {
                pre.as_str()
                    .split('.')
                    .map(|part| match part.parse() {
                        Ok(number) if part.bytes().all(|b| b.is_ascii_digit()) => {
                            PreIdentifier::Numeric(number)
                        }
                        _ => PreIdentifier::Alpha(part.to_string()),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Some(Self { segments, pre })
    }

    fn segment(&self, index: usize) -> u64 {
        self.segments.get(index).copied().unwrap_or_default()
    }
}

impl Ord for TagVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.segments.len().max(other.segments.len());
        (0..len)
            .map(|i| self.segment(i).cmp(&other.segment(i)))
            .find(|ordering| ordering.is_ne())
            .unwrap_or(Ordering::Equal)
            .then_with(|| match (self.pre.is_empty(), other.pre.is_empty()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => self.pre.cmp(&other.pre),
            })
    }
}

impl PartialEq for TagVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other).is_eq()
    }
}

impl Eq for TagVersion {}

impl PartialOrd for TagVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
