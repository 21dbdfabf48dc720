//! Navigation files: the EPUB 3 XHTML nav document (`epub:type="toc"`)
//! and the EPUB 2 NCX.
//!
//! Both reduce to the same ordered [`NavEntry`] sequence, so the
//! consistency checks do not care which one a book ships.

use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

use crate::error::EpubLintError;
use crate::path::{is_external, resolve_relative, split_fragment};
use crate::xml::{attributes, get_attribute, local_name, reader, unescape_lossy};

/// One entry of a navigation list, with its nested children.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NavPoint {
    /// Label text, whitespace-joined
    pub label: String,
    /// Content href as written (relative to the navigation file)
    pub href: String,
    /// Child navigation points
    pub children: Vec<NavPoint>,
}

/// Table of contents, page list and landmarks of one navigation file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Navigation {
    /// Table of contents
    pub toc: Vec<NavPoint>,
    /// Page list entries
    pub page_list: Vec<NavPoint>,
    /// Landmark entries (cover, toc, bodymatter, ...)
    pub landmarks: Vec<NavPoint>,
}

impl Navigation {
    /// Returns `true` if the table of contents lists anything.
    pub fn has_toc(&self) -> bool {
        !self.toc.is_empty()
    }

    /// Number of TOC entries at every depth.
    pub fn toc_count(&self) -> usize {
        count_nav_points(&self.toc)
    }

    /// Depth-first walk of the TOC as `(depth, point)`.
    pub fn toc_flat(&self) -> Vec<(usize, &NavPoint)> {
        let mut result = Vec::new();
        flatten_nav_points(&self.toc, 0, &mut result);
        result
    }
}

fn count_nav_points(points: &[NavPoint]) -> usize {
    points
        .iter()
        .map(|p| 1 + count_nav_points(&p.children))
        .sum()
}

fn flatten_nav_points<'a>(
    points: &'a [NavPoint],
    depth: usize,
    result: &mut Vec<(usize, &'a NavPoint)>,
) {
    for point in points {
        result.push((depth, point));
        flatten_nav_points(&point.children, depth + 1, result);
    }
}

/// Which part of a navigation file an entry came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NavSection {
    /// Table of contents
    Toc,
    /// Page list
    PageList,
    /// Landmarks
    Landmarks,
}

/// One navigation target with its href resolved against the archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NavEntry {
    /// Display label
    pub label: String,
    /// Href as written
    pub href: String,
    /// Normalized archive path of the target document; `None` for external
    /// targets or hrefs escaping the archive
    pub target: Option<String>,
    /// Fragment identifier, without the `#`
    pub fragment: Option<String>,
    /// Section the entry was listed in
    pub section: NavSection,
}

/// Navigation of a book, in the form its package generation uses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NavigationModel {
    /// EPUB 2 NCX hierarchical table at `path`
    Ncx {
        /// Archive path of the NCX
        path: String,
        /// Parsed contents
        navigation: Navigation,
    },
    /// EPUB 3 XHTML navigation document at `path`
    NavDocument {
        /// Archive path of the navigation document
        path: String,
        /// Parsed contents
        navigation: Navigation,
    },
}

impl NavigationModel {
    /// Archive path of the navigation file.
    pub fn path(&self) -> &str {
        match self {
            NavigationModel::Ncx { path, .. } | NavigationModel::NavDocument { path, .. } => path,
        }
    }

    /// Parsed navigation contents.
    pub fn navigation(&self) -> &Navigation {
        match self {
            NavigationModel::Ncx { navigation, .. }
            | NavigationModel::NavDocument { navigation, .. } => navigation,
        }
    }

    /// Every entry in document order: TOC (depth-first), then page list,
    /// then landmarks.
    pub fn entries(&self) -> Vec<NavEntry> {
        let nav = self.navigation();
        let base = self.path();
        let capacity = nav.toc_count() + nav.page_list.len() + nav.landmarks.len();
        let mut out = Vec::with_capacity(capacity);
        for (_, point) in nav.toc_flat() {
            out.push(resolve_entry(base, point, NavSection::Toc));
        }
        for point in &nav.page_list {
            out.push(resolve_entry(base, point, NavSection::PageList));
        }
        for point in &nav.landmarks {
            out.push(resolve_entry(base, point, NavSection::Landmarks));
        }
        out
    }
}

fn resolve_entry(base: &str, point: &NavPoint, section: NavSection) -> NavEntry {
    let (path_part, fragment) = split_fragment(&point.href);
    let target = if is_external(&point.href) {
        None
    } else if path_part.is_empty() {
        // "#frag" points into the navigation file itself
        Some(base.to_string())
    } else {
        resolve_relative(base, &point.href)
    };
    NavEntry {
        label: point.label.clone(),
        href: point.href.clone(),
        target,
        fragment: fragment.filter(|f| !f.is_empty()).map(str::to_string),
        section,
    }
}

/// Nav point still open on the parser stack.
struct PartialNavPoint {
    href: Option<String>,
    label: Option<String>,
    children: Vec<NavPoint>,
}

impl PartialNavPoint {
    fn new() -> Self {
        Self {
            href: None,
            label: None,
            children: Vec::new(),
        }
    }

    fn push_label(&mut self, text: &str) {
        match &mut self.label {
            Some(existing) => {
                // Formatted anchors ("Part <em>One</em>") arrive in pieces
                if !existing.is_empty() && !existing.ends_with(' ') && !text.starts_with(' ') {
                    existing.push(' ');
                }
                existing.push_str(text);
            }
            None => self.label = Some(text.to_string()),
        }
    }

    fn into_nav_point(self) -> Option<NavPoint> {
        let href = self.href?;
        Some(NavPoint {
            label: self.label.unwrap_or_default(),
            href,
            children: self.children,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum NavType {
    Toc,
    PageList,
    Landmarks,
}

impl NavType {
    fn from_epub_type(value: &str) -> Option<Self> {
        value.split_whitespace().find_map(|token| match token {
            "toc" => Some(NavType::Toc),
            "page-list" => Some(NavType::PageList),
            "landmarks" => Some(NavType::Landmarks),
            _ => None,
        })
    }
}

fn epub_type(e: &BytesStart<'_>, reader: &Reader<&[u8]>) -> Option<NavType> {
    attributes(e, reader)
        .into_iter()
        .filter(|(key, _)| key == "epub:type" || key.ends_with(":type"))
        .find_map(|(_, value)| NavType::from_epub_type(&value))
}

/// Parse an XHTML nav document into its `toc`, `page-list` and
/// `landmarks` lists.
///
/// Anchors without an `href` are dropped; anchors with an empty label are
/// kept so missing labels can be reported.
pub fn parse_nav_xhtml(content: &[u8]) -> Result<Navigation, EpubLintError> {
    let mut reader = reader(content);
    let mut nav = Navigation::default();
    let mut buf = Vec::new();

    let mut current: Option<NavType> = None;
    let mut item_stack: Vec<PartialNavPoint> = Vec::new();
    let mut results: Vec<NavPoint> = Vec::new();
    let mut in_anchor = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = local_name(e.name().as_ref(), &reader);
                match name.as_str() {
                    "nav" => {
                        current = epub_type(&e, &reader);
                        results.clear();
                    }
                    "li" if current.is_some() => item_stack.push(PartialNavPoint::new()),
                    "a" if current.is_some() => {
                        in_anchor = true;
                        if let (Some(item), Some(href)) =
                            (item_stack.last_mut(), get_attribute(&e, &reader, "href"))
                        {
                            item.href = Some(href);
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Empty(e)) => {
                if current.is_some() && local_name(e.name().as_ref(), &reader) == "a" {
                    if let (Some(item), Some(href)) =
                        (item_stack.last_mut(), get_attribute(&e, &reader, "href"))
                    {
                        item.href = Some(href);
                    }
                }
            }
            Ok(Event::Text(e)) => {
                if in_anchor {
                    let text = e
                        .decode()
                        .map_err(|e| EpubLintError::Parse(format!("Decode error: {:?}", e)))?;
                    if let Some(item) = item_stack.last_mut() {
                        item.push_label(&unescape_lossy(&text));
                    }
                }
            }
            Ok(Event::GeneralRef(e)) => {
                if in_anchor {
                    let entity = e
                        .decode()
                        .map_err(|e| EpubLintError::Parse(format!("Decode error: {:?}", e)))?;
                    if let Some(item) = item_stack.last_mut() {
                        let resolved = unescape_lossy(&format!("&{};", entity));
                        match &mut item.label {
                            Some(existing) => existing.push_str(&resolved),
                            None => item.label = Some(resolved),
                        }
                    }
                }
            }
            Ok(Event::End(e)) => {
                let name = local_name(e.name().as_ref(), &reader);
                match name.as_str() {
                    "a" => in_anchor = false,
                    "li" if current.is_some() => {
                        if let Some(point) = item_stack.pop().and_then(PartialNavPoint::into_nav_point)
                        {
                            match item_stack.last_mut() {
                                Some(parent) => parent.children.push(point),
                                None => results.push(point),
                            }
                        }
                    }
                    "nav" => {
                        let completed = std::mem::take(&mut results);
                        match current.take() {
                            Some(NavType::Toc) => nav.toc = completed,
                            Some(NavType::PageList) => nav.page_list = completed,
                            Some(NavType::Landmarks) => nav.landmarks = completed,
                            None => {}
                        }
                        item_stack.clear();
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(EpubLintError::Parse(format!(
                    "Nav XML parse error at byte {}: {:?}",
                    reader.buffer_position(),
                    e
                )))
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(nav)
}

/// Parse an NCX: `<navMap>` becomes the TOC, `<pageList>` the page list.
pub fn parse_ncx(content: &[u8]) -> Result<Navigation, EpubLintError> {
    let mut reader = reader(content);
    let mut nav = Navigation::default();
    let mut buf = Vec::new();

    let mut in_nav_map = false;
    let mut in_page_list = false;
    let mut nav_point_stack: Vec<NavPoint> = Vec::new();
    let mut page_target: Option<(String, String)> = None;
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let name = local_name(e.name().as_ref(), &reader);
                match name.as_str() {
                    "navMap" => in_nav_map = true,
                    "pageList" => in_page_list = true,
                    "navPoint" if in_nav_map => nav_point_stack.push(NavPoint {
                        label: String::new(),
                        href: String::new(),
                        children: Vec::new(),
                    }),
                    "pageTarget" if in_page_list => {
                        page_target = Some((String::new(), String::new()));
                    }
                    "text" => in_text = true,
                    "content" => {
                        let src = get_attribute(&e, &reader, "src").unwrap_or_default();
                        if let Some((_, href)) = page_target.as_mut() {
                            *href = src;
                        } else if let Some(point) = nav_point_stack.last_mut() {
                            point.href = src;
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Text(e)) => {
                if in_text {
                    let text = e
                        .decode()
                        .map_err(|e| EpubLintError::Parse(format!("Decode error: {:?}", e)))?;
                    let text = unescape_lossy(&text);
                    if let Some((label, _)) = page_target.as_mut() {
                        label.push_str(&text);
                    } else if let Some(point) = nav_point_stack.last_mut() {
                        point.label.push_str(&text);
                    }
                }
            }
            Ok(Event::End(e)) => {
                let name = local_name(e.name().as_ref(), &reader);
                match name.as_str() {
                    "text" => in_text = false,
                    "navPoint" => {
                        if let Some(completed) = nav_point_stack.pop() {
                            match nav_point_stack.last_mut() {
                                Some(parent) => parent.children.push(completed),
                                None => nav.toc.push(completed),
                            }
                        }
                    }
                    "pageTarget" => {
                        if let Some((label, href)) = page_target.take() {
                            if !href.is_empty() {
                                nav.page_list.push(NavPoint {
                                    label,
                                    href,
                                    children: Vec::new(),
                                });
                            }
                        }
                    }
                    "navMap" => in_nav_map = false,
                    "pageList" => in_page_list = false,
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(EpubLintError::Parse(format!(
                    "NCX parse error at byte {}: {:?}",
                    reader.buffer_position(),
                    e
                )))
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(nav)
}
