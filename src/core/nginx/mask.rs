use anyhow::Result;
use regex::Regex;

/// Hides secrets on the display path. Stored content is never rewritten, so
/// apply always ships the original bytes.
pub struct SecretMasker {
    pem: Regex,
    user_file: Regex,
    authorization: Regex,
}

impl SecretMasker {
    pub fn new() -> Result<Self> {
        Ok(Self {
            pem: Regex::new(r"(?s)-----BEGIN ([A-Z0-9 ]+)-----.*?-----END ([A-Z0-9 ]+)-----")?,
            user_file: Regex::new(r"(?m)(\bauth_basic_user_file\s+)[^;]+;")?,
            authorization: Regex::new(r"(?mi)(\bproxy_set_header\s+Authorization\s+)[^;]+;")?,
        })
    }

    pub fn mask(&self, content: &str) -> String {
        let masked = self
            .pem
            .replace_all(content, "-----BEGIN $1-----[MASKED_CERTIFICATE]-----END $2-----");
        let masked = self.user_file.replace_all(&masked, "${1}[MASKED];");
        self.authorization
            .replace_all(&masked, "${1}[MASKED];")
            .into_owned()
    }
}
