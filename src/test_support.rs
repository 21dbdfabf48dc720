//! In-memory archive fixtures for unit tests.

const SIG_LOCAL_FILE_HEADER: u32 = 0x04034b50;
const SIG_CD_ENTRY: u32 = 0x02014b50;
const SIG_EOCD: u32 = 0x06054b50;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Compression {
    Stored,
    Deflated,
}

struct PendingEntry {
    name: String,
    method: u16,
    crc32: u32,
    data: Vec<u8>,
    uncompressed_size: u64,
    zip64_extra: bool,
}

/// Builds a ZIP archive byte by byte, including deliberately broken ones.
#[derive(Default)]
pub(crate) struct ZipBuilder {
    entries: Vec<PendingEntry>,
    comment_len: usize,
}

impl ZipBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Archive starting with a valid `mimetype`, a container pointer to
    /// `OEBPS/content.opf` and the given package document.
    pub(crate) fn epub(opf: &str) -> Self {
        Self::new()
            .stored("mimetype", b"application/epub+zip")
            .deflated("META-INF/container.xml", CONTAINER_XML.as_bytes())
            .deflated("OEBPS/content.opf", opf.as_bytes())
    }

    pub(crate) fn stored(self, name: &str, content: &[u8]) -> Self {
        self.entry(name, content, Compression::Stored)
    }

    pub(crate) fn deflated(self, name: &str, content: &[u8]) -> Self {
        self.entry(name, content, Compression::Deflated)
    }

    pub(crate) fn entry(mut self, name: &str, content: &[u8], compression: Compression) -> Self {
        let (method, data) = match compression {
            Compression::Stored => (0u16, content.to_vec()),
            Compression::Deflated => (8u16, miniz_oxide::deflate::compress_to_vec(content, 6)),
        };
        self.entries.push(PendingEntry {
            name: name.to_string(),
            method,
            crc32: crc32fast::hash(content),
            data,
            uncompressed_size: content.len() as u64,
            zip64_extra: false,
        });
        self
    }

    /// Entry whose header claims `declared` uncompressed bytes behind
    /// `compressed` bytes of junk.
    pub(crate) fn bomb(mut self, name: &str, compressed: usize, declared: u64) -> Self {
        self.entries.push(PendingEntry {
            name: name.to_string(),
            method: 8,
            crc32: 0,
            data: vec![0u8; compressed],
            uncompressed_size: declared,
            zip64_extra: declared >= u32::MAX as u64,
        });
        self
    }

    /// Override the CRC of the most recently added entry.
    pub(crate) fn with_crc(mut self, crc32: u32) -> Self {
        if let Some(last) = self.entries.last_mut() {
            last.crc32 = crc32;
        }
        self
    }

    pub(crate) fn comment(mut self, len: usize) -> Self {
        self.comment_len = len;
        self
    }

    pub(crate) fn build(self) -> Vec<u8> {
        let mut zip = Vec::new();
        let mut offsets = Vec::with_capacity(self.entries.len());

        for entry in &self.entries {
            offsets.push(zip.len() as u32);
            let extra = extra_field(entry);
            zip.extend_from_slice(&SIG_LOCAL_FILE_HEADER.to_le_bytes());
            zip.extend_from_slice(&20u16.to_le_bytes());
            zip.extend_from_slice(&0u16.to_le_bytes());
            zip.extend_from_slice(&entry.method.to_le_bytes());
            zip.extend_from_slice(&0u16.to_le_bytes());
            zip.extend_from_slice(&0u16.to_le_bytes());
            zip.extend_from_slice(&entry.crc32.to_le_bytes());
            zip.extend_from_slice(&(entry.data.len() as u32).to_le_bytes());
            zip.extend_from_slice(&size32(entry).to_le_bytes());
            zip.extend_from_slice(&(entry.name.len() as u16).to_le_bytes());
            zip.extend_from_slice(&(extra.len() as u16).to_le_bytes());
            zip.extend_from_slice(entry.name.as_bytes());
            zip.extend_from_slice(&extra);
            zip.extend_from_slice(&entry.data);
        }

        let cd_offset = zip.len() as u32;
        for (entry, offset) in self.entries.iter().zip(&offsets) {
            let extra = extra_field(entry);
            zip.extend_from_slice(&SIG_CD_ENTRY.to_le_bytes());
            zip.extend_from_slice(&20u16.to_le_bytes());
            zip.extend_from_slice(&20u16.to_le_bytes());
            zip.extend_from_slice(&0u16.to_le_bytes());
            zip.extend_from_slice(&entry.method.to_le_bytes());
            zip.extend_from_slice(&0u16.to_le_bytes());
            zip.extend_from_slice(&0u16.to_le_bytes());
            zip.extend_from_slice(&entry.crc32.to_le_bytes());
            zip.extend_from_slice(&(entry.data.len() as u32).to_le_bytes());
            zip.extend_from_slice(&size32(entry).to_le_bytes());
            zip.extend_from_slice(&(entry.name.len() as u16).to_le_bytes());
            zip.extend_from_slice(&(extra.len() as u16).to_le_bytes());
            zip.extend_from_slice(&0u16.to_le_bytes());
            zip.extend_from_slice(&0u16.to_le_bytes());
            zip.extend_from_slice(&0u16.to_le_bytes());
            zip.extend_from_slice(&0u32.to_le_bytes());
            zip.extend_from_slice(&offset.to_le_bytes());
            zip.extend_from_slice(entry.name.as_bytes());
            zip.extend_from_slice(&extra);
        }

        let cd_size = zip.len() as u32 - cd_offset;
        let count = self.entries.len() as u16;
        zip.extend_from_slice(&SIG_EOCD.to_le_bytes());
        zip.extend_from_slice(&0u16.to_le_bytes());
        zip.extend_from_slice(&0u16.to_le_bytes());
        zip.extend_from_slice(&count.to_le_bytes());
        zip.extend_from_slice(&count.to_le_bytes());
        zip.extend_from_slice(&cd_size.to_le_bytes());
        zip.extend_from_slice(&cd_offset.to_le_bytes());
        zip.extend_from_slice(&(self.comment_len as u16).to_le_bytes());
        zip.extend(std::iter::repeat(b'A').take(self.comment_len));
        zip
    }
}

fn size32(entry: &PendingEntry) -> u32 {
    if entry.zip64_extra {
        u32::MAX
    } else {
        entry.uncompressed_size as u32
    }
}

fn extra_field(entry: &PendingEntry) -> Vec<u8> {
    if !entry.zip64_extra {
        return Vec::new();
    }
    let mut extra = Vec::with_capacity(12);
    extra.extend_from_slice(&1u16.to_le_bytes());
    extra.extend_from_slice(&8u16.to_le_bytes());
    extra.extend_from_slice(&entry.uncompressed_size.to_le_bytes());
    extra
}

pub(crate) const CONTAINER_XML: &str = r#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#;

/// Package document with the usual metadata around the given manifest and
/// spine bodies.
pub(crate) fn opf(version: &str, manifest: &str, spine: &str) -> String {
    opf_with_metadata(
        version,
        r#"<dc:title>Test Book</dc:title>
    <dc:creator>Tester</dc:creator>
    <dc:identifier id="uid">urn:uuid:0000</dc:identifier>
    <dc:language>en</dc:language>"#,
        manifest,
        spine,
    )
}

pub(crate) fn opf_with_metadata(version: &str, metadata: &str, manifest: &str, spine: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<package version="{version}" unique-identifier="uid" xmlns="http://www.idpf.org/2007/opf">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/" xmlns:opf="http://www.idpf.org/2007/opf">
    {metadata}
  </metadata>
  <manifest>
    {manifest}
  </manifest>
  <spine{toc}>
    {spine}
  </spine>
</package>"#,
        version = version,
        metadata = metadata,
        manifest = manifest,
        toc = if manifest.contains("id=\"ncx\"") {
            " toc=\"ncx\""
        } else {
            ""
        },
        spine = spine,
    )
}

pub(crate) fn xhtml(body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops">
<head><title>t</title></head>
<body>
{}
</body>
</html>"#,
        body
    )
}

pub(crate) fn nav_doc(links: &[&str]) -> String {
    let items: String = links
        .iter()
        .map(|href| format!("<li><a href=\"{}\">Entry</a></li>", href))
        .collect();
    xhtml(&format!("<nav epub:type=\"toc\"><ol>{}</ol></nav>", items))
}

/// A small, clean EPUB 3 book: nav document plus two chapters.
pub(crate) fn clean_book() -> ZipBuilder {
    let manifest = r#"<item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>
    <item id="c1" href="text/ch1.xhtml" media-type="application/xhtml+xml"/>
    <item id="c2" href="text/ch2.xhtml" media-type="application/xhtml+xml"/>
    <item id="cover" href="images/cover.png" media-type="image/png" properties="cover-image"/>
    <item id="css" href="style.css" media-type="text/css"/>"#;
    let spine = r#"<itemref idref="c1"/>
    <itemref idref="c2"/>"#;
    ZipBuilder::epub(&opf("3.0", manifest, spine))
        .deflated(
            "OEBPS/nav.xhtml",
            nav_doc(&["text/ch1.xhtml", "text/ch2.xhtml#s1"]).as_bytes(),
        )
        .deflated(
            "OEBPS/text/ch1.xhtml",
            xhtml(r#"<h1 id="top">One</h1><p><a href="ch2.xhtml#s1">next</a></p>"#).as_bytes(),
        )
        .deflated(
            "OEBPS/text/ch2.xhtml",
            xhtml(r#"<h1 id="s1">Two</h1><p><a href="ch1.xhtml#top">back</a></p>"#).as_bytes(),
        )
        .stored("OEBPS/images/cover.png", &png_header(600, 800))
        .deflated("OEBPS/style.css", b"p { text-indent: 1em; }")
}

/// Minimal PNG signature plus IHDR carrying the given dimensions.
pub(crate) fn png_header(width: u32, height: u32) -> Vec<u8> {
    let mut png = vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
    png.extend_from_slice(&13u32.to_be_bytes());
    png.extend_from_slice(b"IHDR");
    png.extend_from_slice(&width.to_be_bytes());
    png.extend_from_slice(&height.to_be_bytes());
    png.extend_from_slice(&[8, 6, 0, 0, 0]);
    png.extend_from_slice(&[0, 0, 0, 0]);
    png
}
