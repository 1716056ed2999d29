use url::Url;

/// Extracts the accounting key from a tab url. Only http(s) pages are trackable, and two
/// urls sharing a hostname count together no matter the port, path or query. Anything
/// unparseable or non-http (browser internal pages, file uris) simply isn't tracked.
pub fn trackable_domain(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    match parsed.scheme() {
        "http" | "https" => parsed.host_str().map(str::to_owned),
        _ => None,
    }
}
