//! Datasource descriptor (`.tds`) handling
//!
//! Reads the parts of the descriptor the refresh cycle depends on (source
//! connection, extract connection, refresh history) and rewrites single
//! attributes by streaming the document through unchanged otherwise.

use crate::error::{PreconditionViolation, RefreshError, Result};
use crate::literal::ScalarValue;
use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};
use std::path::Path;

/// Engine class of extracts this tool knows how to prune
pub const EXTRACT_ENGINE_CLASS: &str = "hyper";

const EXTRACT: &[u8] = b"extract";
const CONNECTION: &[u8] = b"connection";
const REFRESH: &[u8] = b"refresh";
const REFRESH_EVENT: &[u8] = b"refresh-event";
const INCREMENT_VALUE: &str = "increment-value";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshEvent {
    pub refresh_type: Option<String>,
    pub increment_value: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractInfo {
    pub engine_class: Option<String>,
    /// Path of the extract file, relative to the descriptor's container
    pub dbname: Option<String>,
    pub has_refresh: bool,
    pub refresh_events: Vec<RefreshEvent>,
}

#[derive(Debug, Clone)]
pub struct Descriptor {
    xml: String,
    source_dbname: Option<String>,
    extract: Option<ExtractInfo>,
}

/// Element whose attribute gets patched
#[derive(Debug, Clone, Copy)]
enum Target {
    LastRefreshEvent,
    ExtractConnection,
}

impl Descriptor {
    pub fn parse(xml: impl Into<String>) -> Result<Self> {
        let xml = xml.into();
        let (source_dbname, extract) = scan(&xml)?;
        Ok(Self {
            xml,
            source_dbname,
            extract,
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let xml = std::fs::read_to_string(path).map_err(|e| {
            RefreshError::Descriptor(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(xml)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, &self.xml)?;
        Ok(())
    }

    pub fn xml(&self) -> &str {
        &self.xml
    }

    /// Name of the source database, used to pick the database configuration entry
    pub fn source_dbname(&self) -> Option<&str> {
        self.source_dbname.as_deref()
    }

    pub fn extract(&self) -> Option<&ExtractInfo> {
        self.extract.as_ref()
    }

    /// Checks that must pass before the extract is touched.
    pub fn check_preconditions(&self) -> std::result::Result<&ExtractInfo, PreconditionViolation> {
        let extract = self.extract.as_ref().ok_or(PreconditionViolation::NoExtract)?;

        let engine = extract.engine_class.as_deref().unwrap_or_default();
        if engine != EXTRACT_ENGINE_CLASS {
            return Err(PreconditionViolation::WrongExtractEngine(engine.to_string()));
        }
        if !extract.has_refresh || extract.refresh_events.is_empty() {
            return Err(PreconditionViolation::MissingRefreshHistory);
        }
        if self.source_dbname.is_none() {
            return Err(PreconditionViolation::NoSourceConnection);
        }
        Ok(extract)
    }

    /// Set the last refresh event's increment value to `remaining_max` in descriptor encoding.
    pub fn rewrite_continuation(&self, remaining_max: Option<&ScalarValue>) -> Result<Descriptor> {
        let remaining_max = remaining_max.ok_or_else(|| {
            RefreshError::Descriptor(
                "No rows remain in the extract; refusing to write a continuation marker".to_string(),
            )
        })?;
        self.check_preconditions()
            .map_err(|violation| RefreshError::Descriptor(violation.to_string()))?;

        let literal = remaining_max.descriptor_literal()?;
        self.patch(Target::LastRefreshEvent, INCREMENT_VALUE, &literal)
    }

    /// Point the extract connection at a different extract file.
    pub fn with_extract_dbname(&self, dbname: &str) -> Result<Descriptor> {
        if self.extract.is_none() {
            return Err(RefreshError::Descriptor(
                PreconditionViolation::NoExtract.to_string(),
            ));
        }
        self.patch(Target::ExtractConnection, "dbname", dbname)
    }

    fn patch(&self, target: Target, attribute_name: &str, value: &str) -> Result<Descriptor> {
        let event_count = self
            .extract
            .as_ref()
            .map(|e| e.refresh_events.len())
            .unwrap_or(0);

        let mut reader = Reader::from_str(&self.xml);
        let mut writer = Writer::new(Vec::new());
        let mut stack: Vec<Vec<u8>> = Vec::new();
        let mut seen_events = 0usize;

        loop {
            let event = reader.read_event()?;
            let (element, is_empty) = match event {
                Event::Eof => break,
                Event::End(e) => {
                    stack.pop();
                    writer.write_event(Event::End(e))?;
                    continue;
                }
                Event::Start(e) => (e, false),
                Event::Empty(e) => (e, true),
                other => {
                    writer.write_event(other)?;
                    continue;
                }
            };

            let name = element.name().as_ref().to_vec();
            let in_extract = stack.iter().any(|n| n == EXTRACT);
            let parent = stack.last().map(Vec::as_slice);

            let is_target = match target {
                Target::LastRefreshEvent => {
                    if name == REFRESH_EVENT && in_extract && parent == Some(REFRESH) {
                        seen_events += 1;
                        seen_events == event_count
                    } else {
                        false
                    }
                }
                Target::ExtractConnection => name == CONNECTION && parent == Some(EXTRACT),
            };

            let element = if is_target {
                with_attribute(&element, attribute_name, value)?
            } else {
                element.into_owned()
            };

            if is_empty {
                writer.write_event(Event::Empty(element))?;
            } else {
                writer.write_event(Event::Start(element))?;
                stack.push(name);
            }
        }

        let xml = String::from_utf8(writer.into_inner())
            .map_err(|e| RefreshError::Descriptor(format!("Rewritten descriptor is not UTF-8: {}", e)))?;
        Self::parse(xml)
    }
}

/// Collect the source connection name and extract details.
fn scan(xml: &str) -> Result<(Option<String>, Option<ExtractInfo>)> {
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut source_dbname = None;
    let mut extract: Option<ExtractInfo> = None;

    loop {
        let (element, is_empty) = match reader.read_event()? {
            Event::Eof => break,
            Event::End(_) => {
                stack.pop();
                continue;
            }
            Event::Start(e) => (e, false),
            Event::Empty(e) => (e, true),
            _ => continue,
        };

        let name = element.name().as_ref().to_vec();
        let in_extract = stack.iter().any(|n| n == EXTRACT);
        let parent = stack.last().map(Vec::as_slice);

        match name.as_slice() {
            EXTRACT => extract = Some(ExtractInfo::default()),
            CONNECTION if parent == Some(EXTRACT) => {
                if let Some(info) = extract.as_mut() {
                    info.engine_class = attribute(&element, "class")?;
                    info.dbname = attribute(&element, "dbname")?;
                }
            }
            CONNECTION if !in_extract && source_dbname.is_none() => {
                let class = attribute(&element, "class")?;
                let dbname = attribute(&element, "dbname")?.filter(|d| !d.is_empty());
                if class.as_deref() != Some("federated") {
                    source_dbname = dbname;
                }
            }
            REFRESH if in_extract => {
                if let Some(info) = extract.as_mut() {
                    info.has_refresh = true;
                }
            }
            REFRESH_EVENT if in_extract && parent == Some(REFRESH) => {
                if let Some(info) = extract.as_mut() {
                    info.refresh_events.push(RefreshEvent {
                        refresh_type: attribute(&element, "refresh-type")?,
                        increment_value: attribute(&element, INCREMENT_VALUE)?,
                    });
                }
            }
            _ => {}
        }

        if !is_empty {
            stack.push(name);
        }
    }

    Ok((source_dbname, extract))
}

fn attribute(element: &BytesStart<'_>, name: &str) -> Result<Option<String>> {
    for attr in element.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        if attr.key.as_ref() == name.as_bytes() {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

fn with_attribute(element: &BytesStart<'_>, name: &str, value: &str) -> Result<BytesStart<'static>> {
    let tag = String::from_utf8_lossy(element.name().as_ref()).into_owned();
    let mut patched = BytesStart::new(tag);
    let mut replaced = false;

    for attr in element.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        if attr.key.as_ref() == name.as_bytes() {
            patched.push_attribute((name, value));
            replaced = true;
        } else {
            patched.push_attribute(attr);
        }
    }
    if !replaced {
        patched.push_attribute((name, value));
    }

    Ok(patched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::literal::ColumnType;

    const TDS: &str = r#"<?xml version='1.0' encoding='utf-8' ?>
<datasource formatted-name='orders' inline='true' version='18.1'>
  <connection class='federated'>
    <named-connections>
      <named-connection caption='db.example.com' name='postgres.0x1'>
        <connection class='postgres' dbname='sales' port='5432' server='db.example.com' />
      </named-connection>
    </named-connections>
  </connection>
  <extract count='-1' enabled='true' units='records'>
    <connection class='hyper' dbname='Data/Extracts/orders.hyper' schema='Extract' tablename='Extract' />
    <refresh increment-key='order_date' incremental-updates='true'>
      <refresh-event add-from-file-path='' increment-value='%null%' refresh-type='create' rows-inserted='10' />
      <refresh-event add-from-file-path='' increment-value='#2021-01-10#' refresh-type='increment' rows-inserted='4' />
    </refresh>
  </extract>
</datasource>
"#;

    #[test]
    fn test_parse_reads_connections_and_history() {
        let descriptor = Descriptor::parse(TDS).unwrap();
        assert_eq!(descriptor.source_dbname(), Some("sales"));

        let extract = descriptor.check_preconditions().unwrap();
        assert_eq!(extract.engine_class.as_deref(), Some("hyper"));
        assert_eq!(extract.dbname.as_deref(), Some("Data/Extracts/orders.hyper"));
        assert_eq!(extract.refresh_events.len(), 2);
        assert_eq!(extract.refresh_events[1].increment_value.as_deref(), Some("#2021-01-10#"));
    }

    #[test]
    fn test_rewrite_touches_only_last_event() {
        let descriptor = Descriptor::parse(TDS).unwrap();
        let remaining = ScalarValue::new("2021-01-14", ColumnType::Date);

        let rewritten = descriptor.rewrite_continuation(Some(&remaining)).unwrap();
        let events = &rewritten.extract().unwrap().refresh_events;
        assert_eq!(events[0].increment_value.as_deref(), Some("%null%"));
        assert_eq!(events[1].increment_value.as_deref(), Some("#2021-01-14#"));
        assert_eq!(events[1].refresh_type.as_deref(), Some("increment"));

        // everything outside the patched element is byte-identical
        let before: Vec<&str> = TDS.lines().filter(|l| !l.contains("#2021-01-10#")).collect();
        let after: Vec<&str> = rewritten.xml().lines().filter(|l| !l.contains("#2021-01-14#")).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_rewrite_refuses_missing_remaining_value() {
        let descriptor = Descriptor::parse(TDS).unwrap();
        assert!(matches!(
            descriptor.rewrite_continuation(None),
            Err(RefreshError::Descriptor(_))
        ));
    }

    #[test]
    fn test_numeric_continuation_is_written_as_is() {
        let descriptor = Descriptor::parse(TDS).unwrap();
        let remaining = ScalarValue::new("1041", ColumnType::Numeric);
        let rewritten = descriptor.rewrite_continuation(Some(&remaining)).unwrap();
        assert_eq!(
            rewritten.extract().unwrap().refresh_events[1].increment_value.as_deref(),
            Some("1041")
        );
    }

    #[test]
    fn test_preconditions() {
        let no_extract = Descriptor::parse(
            "<datasource><connection class='postgres' dbname='sales'/></datasource>",
        )
        .unwrap();
        assert_eq!(no_extract.check_preconditions().unwrap_err(), PreconditionViolation::NoExtract);

        let wrong_engine = Descriptor::parse(TDS.replace("class='hyper'", "class='dataengine'")).unwrap();
        assert_eq!(
            wrong_engine.check_preconditions().unwrap_err(),
            PreconditionViolation::WrongExtractEngine("dataengine".to_string())
        );

        let no_history = Descriptor::parse(
            "<datasource><connection class='postgres' dbname='sales'/>\
             <extract><connection class='hyper' dbname='x.hyper'/></extract></datasource>",
        )
        .unwrap();
        assert_eq!(
            no_history.check_preconditions().unwrap_err(),
            PreconditionViolation::MissingRefreshHistory
        );
    }

    #[test]
    fn test_with_extract_dbname() {
        let descriptor = Descriptor::parse(TDS).unwrap();
        let moved = descriptor.with_extract_dbname("download/orders.hyper").unwrap();
        assert_eq!(
            moved.extract().unwrap().dbname.as_deref(),
            Some("download/orders.hyper")
        );
        assert_eq!(moved.source_dbname(), Some("sales"));
    }
}
