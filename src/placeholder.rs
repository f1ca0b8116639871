/// Request-scoped values available for `{...}` placeholder expansion in
/// handler directives (executable args, upstream spec, detector command).
///
/// Supported tokens: `{path}`, `{query}`, `{method}`, `{host}` and
/// `{env.NAME}` (resolved against the host process environment, empty when
/// unset). Unknown tokens are left untouched so downstream programs can
/// receive literal braces.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub path: String,
    pub query: String,
    pub method: String,
    pub host: String,
}

impl RequestContext {
    pub fn new(method: &str, path: &str, query: &str, host: &str) -> Self {
        Self {
            path: path.to_string(),
            query: query.to_string(),
            method: method.to_string(),
            host: host.to_string(),
        }
    }

    /// Build the context from request parts.
    pub fn from_request<B>(req: &hyper::Request<B>) -> Self {
        let host = req
            .headers()
            .get(hyper::header::HOST)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("")
            .to_string();
        Self {
            path: req.uri().path().to_string(),
            query: req.uri().query().unwrap_or("").to_string(),
            method: req.method().as_str().to_string(),
            host,
        }
    }

    /// Expand all recognized `{...}` tokens in the input.
    pub fn expand(&self, input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            match after.find('}') {
                Some(end) => {
                    let token = &after[..end];
                    match self.lookup(token) {
                        Some(value) => out.push_str(&value),
                        None => {
                            out.push('{');
                            out.push_str(token);
                            out.push('}');
                        }
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    // Unterminated brace, keep the remainder as-is
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }

    fn lookup(&self, token: &str) -> Option<String> {
        match token {
            "path" => Some(self.path.clone()),
            "query" => Some(self.query.clone()),
            "method" => Some(self.method.clone()),
            "host" => Some(self.host.clone()),
            _ => token
                .strip_prefix("env.")
                .map(|name| std::env::var(name).unwrap_or_default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RequestContext {
        RequestContext::new("GET", "/some/path", "x=y", "example.com")
    }

    #[test]
    fn test_expand_request_tokens() {
        let ctx = ctx();
        assert_eq!(ctx.expand("{path}"), "/some/path");
        assert_eq!(ctx.expand("{method} {path}?{query}"), "GET /some/path?x=y");
        assert_eq!(ctx.expand("{host}"), "example.com");
    }

    #[test]
    fn test_expand_inside_larger_string() {
        let ctx = ctx();
        assert_eq!(ctx.expand("./detect.py {path} --v"), "./detect.py /some/path --v");
    }

    #[test]
    fn test_unknown_token_kept() {
        let ctx = ctx();
        assert_eq!(ctx.expand("{nope}"), "{nope}");
        assert_eq!(ctx.expand("a{b"), "a{b");
    }

    #[test]
    fn test_env_token() {
        std::env::set_var("EXECGATE_TEST_PLACEHOLDER", "hello");
        let ctx = ctx();
        assert_eq!(ctx.expand("{env.EXECGATE_TEST_PLACEHOLDER}"), "hello");
        assert_eq!(ctx.expand("{env.EXECGATE_TEST_UNSET_VAR}"), "");
    }

    #[test]
    fn test_no_tokens() {
        assert_eq!(ctx().expand("plain"), "plain");
        assert_eq!(ctx().expand(""), "");
    }
}
