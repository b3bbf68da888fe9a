/// Shortest prefix length that tells every id apart, never below `min`.
///
/// Used only to shorten ids for display; filtering always works on the full
/// id or an explicit glob.
pub fn shortest_unique_prefix<S: AsRef<str>>(ids: &[S], min: usize) -> usize {
    let mut sorted: Vec<&str> = ids.iter().map(AsRef::as_ref).collect();
    sorted.sort_unstable();
    sorted.dedup();

    let longest = sorted.iter().map(|id| id.len()).max().unwrap_or(0);
    let needed = sorted
        .windows(2)
        .map(|pair| common_prefix(pair[0], pair[1]) + 1)
        .max()
        .unwrap_or(0);

    needed.max(min).min(longest.max(min))
}

fn common_prefix(a: &str, b: &str) -> usize {
    a.bytes().zip(b.bytes()).take_while(|(x, y)| x == y).count()
}
