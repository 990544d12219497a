//! Streaming markdown rendering
//!
//! Assistant output arrives as deltas; the renderer accumulates the raw text
//! and re-renders the whole buffer on each append so the produced HTML is
//! deterministic for a given delta sequence regardless of chunk boundaries.

use pulldown_cmark::{html, Options, Parser};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkdownRenderer {
    source: String,
    rendered: String,
}

impl MarkdownRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a delta and return the re-rendered HTML for the full document.
    pub fn put_and_render(&mut self, delta: &str) -> &str {
        self.source.push_str(delta);
        self.rendered = render(&self.source);
        &self.rendered
    }

    /// Raw accumulated source text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Last rendered HTML.
    pub fn html(&self) -> &str {
        &self.rendered
    }
}

fn render(source: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    let parser = Parser::new_ext(source, options);
    let mut out = String::with_capacity(source.len() * 2);
    html::push_html(&mut out, parser);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_incrementally() {
        let mut doc = MarkdownRenderer::new();
        doc.put_and_render("# Sca");
        let html = doc.put_and_render("n report\n\n- open port");
        assert!(html.contains("<h1>Scan report</h1>"));
        assert!(html.contains("<li>open port</li>"));
    }

    #[test]
    fn deterministic_across_chunk_boundaries() {
        let mut a = MarkdownRenderer::new();
        a.put_and_render("hello **wor");
        a.put_and_render("ld**");

        let mut b = MarkdownRenderer::new();
        b.put_and_render("hello **world**");

        assert_eq!(a.html(), b.html());
        assert_eq!(a.source(), "hello **world**");
    }
}
