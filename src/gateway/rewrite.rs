use reqwest::Url;
use reqwest::header::{HeaderMap, HeaderValue, LINK, LOCATION};

/// 客户端看到的代理地址，入站时由 Host 与监听协议确定。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOrigin {
    pub proto: &'static str,
    pub host: String,
}

impl ClientOrigin {
    pub fn base(&self) -> String {
        format!("{}://{}/", self.proto, self.host)
    }
}

/// 上游地址 + 客户端路径：路径以单个 `/` 相连，query 以 `&` 合并（上游在前）。
pub fn target_url(base: &Url, path: &str, query: Option<&str>) -> Url {
    let mut url = base.clone();
    let joined = format!(
        "{}/{}",
        base.path().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    url.set_path(&joined);

    let query = match (base.query().filter(|q| !q.is_empty()), query.filter(|q| !q.is_empty())) {
        (Some(b), Some(c)) => Some(format!("{b}&{c}")),
        (Some(b), None) => Some(b.to_string()),
        (None, Some(c)) => Some(c.to_string()),
        (None, None) => None,
    };
    url.set_query(query.as_deref());
    url
}

/// 把 `Link` / `Location` 中的上游地址替换为代理地址。
pub fn rewrite_links(headers: &mut HeaderMap, upstream_base: &str, origin: &ClientOrigin) {
    let replacement = origin.base();
    if replacement == upstream_base {
        return;
    }

    for name in [LINK, LOCATION] {
        let values: Vec<HeaderValue> = headers.get_all(&name).iter().cloned().collect();
        if values.is_empty() {
            continue;
        }

        let mut changed = false;
        let mut rewritten = Vec::with_capacity(values.len());
        for value in values {
            match value.to_str() {
                Ok(s) if s.contains(upstream_base) => {
                    match HeaderValue::from_str(&s.replace(upstream_base, &replacement)) {
                        Ok(v) => {
                            changed = true;
                            rewritten.push(v);
                        }
                        Err(_) => rewritten.push(value),
                    }
                }
                _ => rewritten.push(value),
            }
        }

        if changed {
            headers.remove(&name);
            for v in rewritten {
                headers.append(name.clone(), v);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin(proto: &'static str, host: &str) -> ClientOrigin {
        ClientOrigin {
            proto,
            host: host.to_string(),
        }
    }

    #[test]
    fn pagination_link_points_at_proxy() {
        let mut h = HeaderMap::new();
        h.insert(
            LINK,
            HeaderValue::from_static(
                "<https://upstream.example/resource?page=2>; rel=\"next\", <https://upstream.example/resource?page=9>; rel=\"last\"",
            ),
        );
        rewrite_links(&mut h, "https://upstream.example/", &origin("https", "proxy.example"));
        assert_eq!(
            h[LINK],
            "<https://proxy.example/resource?page=2>; rel=\"next\", <https://proxy.example/resource?page=9>; rel=\"last\""
        );

        // 再次改写不产生变化。
        let once = h.clone();
        rewrite_links(&mut h, "https://upstream.example/", &origin("https", "proxy.example"));
        assert_eq!(h, once);
    }

    #[test]
    fn unrelated_links_and_other_headers_untouched() {
        let mut h = HeaderMap::new();
        h.insert(LINK, HeaderValue::from_static("<https://elsewhere.example/x>; rel=\"next\""));
        h.insert("x-note", HeaderValue::from_static("https://upstream.example/keep"));
        let before = h.clone();
        rewrite_links(&mut h, "https://upstream.example/", &origin("http", "127.0.0.1:44879"));
        assert_eq!(h, before);
    }

    #[test]
    fn location_is_rewritten_too() {
        let mut h = HeaderMap::new();
        h.insert(LOCATION, HeaderValue::from_static("https://api.github.com/repositories/1"));
        rewrite_links(&mut h, "https://api.github.com/", &origin("http", "localhost:8080"));
        assert_eq!(h[LOCATION], "http://localhost:8080/repositories/1");
    }

    #[test]
    fn target_url_joins_paths_and_queries() {
        let base = Url::parse("https://ghe.example/api/v3/?tenant=t").unwrap();
        let url = target_url(&base, "/repos/o/r", Some("page=2"));
        assert_eq!(url.as_str(), "https://ghe.example/api/v3/repos/o/r?tenant=t&page=2");

        let base = Url::parse("https://api.github.com/").unwrap();
        assert_eq!(target_url(&base, "/", None).as_str(), "https://api.github.com/");
        assert_eq!(
            target_url(&base, "//user", Some("")).as_str(),
            "https://api.github.com/user"
        );
    }
}
