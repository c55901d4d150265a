//! 研究提示词模板与渲染
//!
//! 规划回复中以 [`SEARCH_QUERY_MARKER`] 开头的行即一条搜索查询，冒号后的文本为查询内容。

use crate::search::SearchResult;

pub const SEARCH_QUERY_MARKER: &str = "- Search Query";

pub const RESEARCHER_SYSTEM_PROMPT: &str = "\
You are an AI Research Agent that helps business professionals gather and analyze information from the web.
Your goal is to provide comprehensive, accurate, and well-structured research on any requested topic.

Work through these steps:
1. Understand the research query and identify the key aspects to investigate
2. Plan a research strategy with specific sub-topics to explore
3. Gather information from search results
4. Analyze and structure the information in the requested format
5. Summarize the findings with citations

Always cite your sources and keep a critical perspective on the information you find.";

pub const SEARCH_PLANNING_PROMPT: &str = "\
Given the research topic: \"{query}\"

Identify 3-5 specific search queries that would help gather comprehensive information about this topic.
For each query, briefly explain what information you expect to find and why it is relevant.

Format your response as:
- Search Query 1: [query]
  - Expected information: [brief explanation]
- Search Query 2: [query]
  - Expected information: [brief explanation]
And so on...";

pub const INFORMATION_SYNTHESIS_PROMPT: &str = "\
Based on the search results provided, synthesize the information into a comprehensive response about: \"{query}\"

Search results:
{search_results}

Your response should:
1. Give a clear overview of the topic
2. Cover the key aspects and relevant details
3. Structure the information logically
4. Include citations to sources
5. Highlight any limitations or gaps in the information

Format the response in a clean, readable structure with headings and sections.";

pub const REFLECTION_PROMPT: &str = "\
Review your research on: \"{query}\"

Research content:
{research_content}

Reflect on the following:
1. Is the information comprehensive and well-structured?
2. Are there gaps or missing perspectives that should be addressed?
3. Are all claims supported by sources?
4. Is the information presented in a balanced way?

Identify the improvements needed and explain how they would raise the quality of the research.";

pub const REVISION_PROMPT: &str = "\
Your original research:

{draft}

Your reflection on areas to improve:

{critique}

Now, provide an improved version of the research that addresses these points.";

/// 单遍填充模板：只扫描模板本身，填入的值中出现的 `{name}` 原样保留；未知占位符原样输出
fn fill(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        let replaced = tail.find('}').and_then(|close| {
            let name = &tail[1..close];
            values
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| (*value, close))
        });
        match replaced {
            Some((value, close)) => {
                out.push_str(value);
                rest = &tail[close + 1..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

pub fn planning_prompt(query: &str) -> String {
    fill(SEARCH_PLANNING_PROMPT, &[("query", query)])
}

pub fn synthesis_prompt(query: &str, rendered_results: &str) -> String {
    fill(
        INFORMATION_SYNTHESIS_PROMPT,
        &[("query", query), ("search_results", rendered_results)],
    )
}

pub fn reflection_prompt(query: &str, draft: &str) -> String {
    fill(REFLECTION_PROMPT, &[("query", query), ("research_content", draft)])
}

pub fn revision_prompt(draft: &str, critique: &str) -> String {
    fill(REVISION_PROMPT, &[("draft", draft), ("critique", critique)])
}

/// 从规划回复中取出搜索查询；一条都没有时回退为原始查询
pub fn parse_search_queries(response: &str, original_query: &str) -> Vec<String> {
    let queries: Vec<String> = response
        .lines()
        .filter(|line| line.trim_start().starts_with(SEARCH_QUERY_MARKER))
        .filter_map(|line| line.split_once(':'))
        .map(|(_, text)| text.trim().to_string())
        .filter(|text| !text.is_empty())
        .collect();

    if queries.is_empty() {
        vec![original_query.to_string()]
    } else {
        queries
    }
}

fn or_placeholder<'a>(value: &'a str, placeholder: &'a str) -> &'a str {
    if value.trim().is_empty() {
        placeholder
    } else {
        value
    }
}

/// 每条结果渲染为固定块（编号 + Title / Source / Snippet），空字段用占位文本
pub fn render_search_results(results: &[SearchResult]) -> String {
    results
        .iter()
        .enumerate()
        .map(|(i, r)| {
            format!(
                "Result {}:\nTitle: {}\nSource: {}\nSnippet: {}\n\n",
                i + 1,
                or_placeholder(&r.title, "No title"),
                or_placeholder(&r.link, "No link"),
                or_placeholder(&r.snippet, "No snippet"),
            )
        })
        .collect()
}
