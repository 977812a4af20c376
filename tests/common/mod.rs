//! Synthetic EPUB archives for integration tests
#![allow(dead_code)]

use std::path::Path;

const SIG_LOCAL_FILE_HEADER: u32 = 0x04034b50;
const SIG_CD_ENTRY: u32 = 0x02014b50;
const SIG_EOCD: u32 = 0x06054b50;

/// Minimal ZIP writer: stored or raw-DEFLATE entries, no extra fields.
pub fn zip_bytes(files: &[(String, Vec<u8>, bool)]) -> Vec<u8> {
    let mut zip = Vec::new();
    let mut central = Vec::new();

    for (name, content, deflate) in files {
        let name = name.as_bytes();
        let crc = crc32fast::hash(content);
        let (method, data) = if *deflate {
            (8u16, miniz_oxide::deflate::compress_to_vec(content, 6))
        } else {
            (0u16, content.clone())
        };
        let offset = zip.len() as u32;

        zip.extend_from_slice(&SIG_LOCAL_FILE_HEADER.to_le_bytes());
        zip.extend_from_slice(&20u16.to_le_bytes());
        zip.extend_from_slice(&0u16.to_le_bytes());
        zip.extend_from_slice(&method.to_le_bytes());
        zip.extend_from_slice(&0u32.to_le_bytes());
        zip.extend_from_slice(&crc.to_le_bytes());
        zip.extend_from_slice(&(data.len() as u32).to_le_bytes());
        zip.extend_from_slice(&(content.len() as u32).to_le_bytes());
        zip.extend_from_slice(&(name.len() as u16).to_le_bytes());
        zip.extend_from_slice(&0u16.to_le_bytes());
        zip.extend_from_slice(name);
        zip.extend_from_slice(&data);

        central.extend_from_slice(&SIG_CD_ENTRY.to_le_bytes());
        central.extend_from_slice(&20u16.to_le_bytes());
        central.extend_from_slice(&20u16.to_le_bytes());
        central.extend_from_slice(&0u16.to_le_bytes());
        central.extend_from_slice(&method.to_le_bytes());
        central.extend_from_slice(&0u32.to_le_bytes());
        central.extend_from_slice(&crc.to_le_bytes());
        central.extend_from_slice(&(data.len() as u32).to_le_bytes());
        central.extend_from_slice(&(content.len() as u32).to_le_bytes());
        central.extend_from_slice(&(name.len() as u16).to_le_bytes());
        central.extend_from_slice(&[0u8; 12]);
        central.extend_from_slice(&offset.to_le_bytes());
        central.extend_from_slice(name);
    }

    let cd_offset = zip.len() as u32;
    let count = files.len() as u16;
    zip.extend_from_slice(&central);
    zip.extend_from_slice(&SIG_EOCD.to_le_bytes());
    zip.extend_from_slice(&[0u8; 4]);
    zip.extend_from_slice(&count.to_le_bytes());
    zip.extend_from_slice(&count.to_le_bytes());
    zip.extend_from_slice(&(central.len() as u32).to_le_bytes());
    zip.extend_from_slice(&cd_offset.to_le_bytes());
    zip.extend_from_slice(&0u16.to_le_bytes());
    zip
}

/// `count` paragraphs of `words` words each, inside an XHTML document.
pub fn chapter_markup(title: &str, count: usize, words: usize) -> String {
    let mut body = String::new();
    for p in 0..count {
        let text = (0..words)
            .map(|w| format!("w{}x{}", p, w))
            .collect::<Vec<_>>()
            .join(" ");
        body.push_str(&format!("<p>{}</p>\n", text));
    }
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <html xmlns=\"http://www.w3.org/1999/xhtml\"><head><title>{title}</title></head>\n\
         <body>\n{body}</body></html>"
    )
}

/// Builder for a small EPUB 3 archive rooted at `OEBPS/content.opf`
pub struct EpubBuilder {
    title: String,
    author: String,
    subjects: Vec<String>,
    chapters: Vec<(String, String)>,
    deflate: bool,
    mimetype: Option<String>,
}

impl EpubBuilder {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            author: "Test Author".to_string(),
            subjects: Vec::new(),
            chapters: Vec::new(),
            deflate: true,
            mimetype: Some("application/epub+zip".to_string()),
        }
    }

    pub fn author(mut self, author: &str) -> Self {
        self.author = author.to_string();
        self
    }

    pub fn subject(mut self, subject: &str) -> Self {
        self.subjects.push(subject.to_string());
        self
    }

    /// Add a chapter at `OEBPS/text/{name}`.
    pub fn chapter(mut self, name: &str, markup: String) -> Self {
        self.chapters.push((name.to_string(), markup));
        self
    }

    pub fn stored(mut self) -> Self {
        self.deflate = false;
        self
    }

    pub fn mimetype(mut self, mimetype: Option<&str>) -> Self {
        self.mimetype = mimetype.map(str::to_string);
        self
    }

    fn package(&self) -> String {
        let mut manifest = String::new();
        let mut spine = String::new();
        for (idx, (name, _)) in self.chapters.iter().enumerate() {
            manifest.push_str(&format!(
                "    <item id=\"c{idx}\" href=\"text/{name}\" \
                 media-type=\"application/xhtml+xml\"/>\n"
            ));
            spine.push_str(&format!("    <itemref idref=\"c{idx}\"/>\n"));
        }
        let subjects: String = self
            .subjects
            .iter()
            .map(|s| format!("    <dc:subject>{s}</dc:subject>\n"))
            .collect();
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <package xmlns=\"http://www.idpf.org/2007/opf\" version=\"3.0\">\n\
             <metadata xmlns:dc=\"http://purl.org/dc/elements/1.1/\">\n\
             \x20   <dc:title>{}</dc:title>\n\
             \x20   <dc:creator>{}</dc:creator>\n\
             \x20   <dc:description>A synthetic book</dc:description>\n\
             {subjects}</metadata>\n\
             <manifest>\n{manifest}</manifest>\n\
             <spine>\n{spine}</spine>\n\
             </package>",
            self.title, self.author
        )
    }

    pub fn build(&self) -> Vec<u8> {
        let container = "<?xml version=\"1.0\"?>\n\
             <container version=\"1.0\" \
             xmlns=\"urn:oasis:names:tc:opendocument:xmlns:container\">\n\
             <rootfiles><rootfile full-path=\"OEBPS/content.opf\" \
             media-type=\"application/oebps-package+xml\"/></rootfiles>\n\
             </container>";

        let mut files = Vec::new();
        if let Some(mimetype) = &self.mimetype {
            files.push(("mimetype".to_string(), mimetype.as_bytes().to_vec(), false));
        }
        files.push((
            "META-INF/container.xml".to_string(),
            container.as_bytes().to_vec(),
            self.deflate,
        ));
        files.push((
            "OEBPS/content.opf".to_string(),
            self.package().into_bytes(),
            self.deflate,
        ));
        for (name, markup) in &self.chapters {
            files.push((
                format!("OEBPS/text/{name}"),
                markup.as_bytes().to_vec(),
                self.deflate,
            ));
        }
        zip_bytes(&files)
    }

    /// Write the archive to `dir/file_name` and return its path.
    pub fn write_to(&self, dir: &Path, file_name: &str) -> String {
        let path = dir.join(file_name);
        std::fs::write(&path, self.build()).unwrap();
        path.to_string_lossy().into_owned()
    }
}
