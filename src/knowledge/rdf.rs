//! RDF store adapter.
//!
//! Parses Turtle files into an in-memory triple arena and answers
//! SPARQL-style `SELECT` queries expressed as basic graph patterns with
//! optional pre-bound variables. Terms are interned once; nodes and
//! edges are integer handles into the arena, so the cyclic knowledge
//! graph needs no reference counting.
//!
//! No writes happen at runtime; a parse failure in any file aborts the
//! load.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use rio_api::model::{Literal as RioLiteral, Subject, Term as RioTerm, Triple as RioTriple};
use rio_api::parser::TriplesParser;
use rio_turtle::{TurtleError, TurtleParser};
use tracing::{debug, info};

use crate::error::{CoreError, CoreResult};

/// RDF vocabulary of the knowledge corpus.
pub mod vocab {
    pub const KB: &str = "http://askql.io/kb#";
    pub const RDF_TYPE: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#type";

    /// `kb:<local>` IRI.
    pub fn kb(local: &str) -> String {
        format!("{}{}", KB, local)
    }
}

/// An interned RDF term.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Term {
    Iri(String),
    Blank(String),
    Literal(String),
}

impl Term {
    pub fn iri(value: &str) -> Self {
        Term::Iri(value.to_string())
    }

    pub fn literal(value: &str) -> Self {
        Term::Literal(value.to_string())
    }

    /// Literal value or local IRI fragment, for projection into records.
    pub fn as_text(&self) -> &str {
        match self {
            Term::Literal(v) => v,
            Term::Iri(v) => v.rsplit(['#', '/']).next().unwrap_or(v),
            Term::Blank(v) => v,
        }
    }
}

/// Handle into the term arena.
pub type TermId = u32;

/// One position of a triple pattern: a concrete term or a variable.
#[derive(Debug, Clone)]
pub enum Pattern {
    Term(Term),
    Var(String),
}

impl Pattern {
    pub fn var(name: &str) -> Self {
        Pattern::Var(name.to_string())
    }

    pub fn iri(value: &str) -> Self {
        Pattern::Term(Term::iri(value))
    }
}

/// A triple pattern in a basic graph pattern.
#[derive(Debug, Clone)]
pub struct TriplePattern {
    pub subject: Pattern,
    pub predicate: Pattern,
    pub object: Pattern,
}

impl TriplePattern {
    pub fn new(subject: Pattern, predicate: Pattern, object: Pattern) -> Self {
        Self {
            subject,
            predicate,
            object,
        }
    }
}

/// Variable bindings produced by [`TripleStore::select`].
pub type Bindings = HashMap<String, Term>;

/// In-memory triple store with interned terms.
#[derive(Debug, Default)]
pub struct TripleStore {
    terms: Vec<Term>,
    interned: HashMap<Term, TermId>,
    triples: Vec<(TermId, TermId, TermId)>,
    by_predicate: HashMap<TermId, Vec<usize>>,
}

impl TripleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse every `.ttl` file in a directory. Any parse failure is
    /// fatal.
    pub fn load_dir<P: AsRef<Path>>(dir: P) -> CoreResult<Self> {
        let dir = dir.as_ref();
        let mut store = Self::new();
        let mut files = 0usize;

        let entries = std::fs::read_dir(dir).map_err(|e| {
            CoreError::Config(format!("cannot read knowledge dir {}: {}", dir.display(), e))
        })?;

        let mut paths: Vec<_> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|x| x.to_str()) == Some("ttl"))
            .collect();
        paths.sort();

        for path in paths {
            store.load_file(&path)?;
            files += 1;
        }

        if files == 0 {
            return Err(CoreError::Config(format!(
                "no TTL files found in {}",
                dir.display()
            )));
        }

        info!(files, triples = store.triples.len(), "knowledge corpus parsed");
        Ok(store)
    }

    /// Parse a single Turtle file into the store.
    pub fn load_file(&mut self, path: &Path) -> CoreResult<()> {
        let file = File::open(path).map_err(|e| {
            CoreError::Config(format!("cannot open {}: {}", path.display(), e))
        })?;
        let mut parser = TurtleParser::new(BufReader::new(file), None);

        let result: Result<(), TurtleError> = parser.parse_all(&mut |t: RioTriple<'_>| {
            self.insert_rio(&t);
            Ok(())
        });

        result.map_err(|e| {
            CoreError::Config(format!("TTL parse error in {}: {}", path.display(), e))
        })?;
        debug!(file = %path.display(), "TTL file parsed");
        Ok(())
    }

    /// Parse Turtle text into the store (loader tests, fixtures).
    pub fn load_str(&mut self, content: &str) -> CoreResult<()> {
        let mut parser = TurtleParser::new(content.as_bytes(), None);
        let result: Result<(), TurtleError> = parser.parse_all(&mut |t: RioTriple<'_>| {
            self.insert_rio(&t);
            Ok(())
        });
        result.map_err(|e| CoreError::Config(format!("TTL parse error: {}", e)))
    }

    fn insert_rio(&mut self, triple: &RioTriple<'_>) {
        let s = match &triple.subject {
            Subject::NamedNode(n) => Term::Iri(n.iri.to_string()),
            Subject::BlankNode(b) => Term::Blank(b.id.to_string()),
            Subject::Triple(_) => return,
        };
        let p = Term::Iri(triple.predicate.iri.to_string());
        let o = match &triple.object {
            RioTerm::NamedNode(n) => Term::Iri(n.iri.to_string()),
            RioTerm::BlankNode(b) => Term::Blank(b.id.to_string()),
            RioTerm::Literal(l) => Term::Literal(
                match l {
                    RioLiteral::Simple { value } => value,
                    RioLiteral::LanguageTaggedString { value, .. } => value,
                    RioLiteral::Typed { value, .. } => value,
                }
                .to_string(),
            ),
            RioTerm::Triple(_) => return,
        };
        self.insert(s, p, o);
    }

    /// Intern a term, returning its handle.
    fn intern(&mut self, term: Term) -> TermId {
        if let Some(&id) = self.interned.get(&term) {
            return id;
        }
        let id = self.terms.len() as TermId;
        self.terms.push(term.clone());
        self.interned.insert(term, id);
        id
    }

    /// Add a triple (load time only).
    pub fn insert(&mut self, s: Term, p: Term, o: Term) {
        let s = self.intern(s);
        let p = self.intern(p);
        let o = self.intern(o);
        let idx = self.triples.len();
        self.triples.push((s, p, o));
        self.by_predicate.entry(p).or_default().push(idx);
    }

    pub fn len(&self) -> usize {
        self.triples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triples.is_empty()
    }

    fn term_id(&self, term: &Term) -> Option<TermId> {
        self.interned.get(term).copied()
    }

    pub fn term(&self, id: TermId) -> &Term {
        &self.terms[id as usize]
    }

    /// Subjects carrying `rdf:type <class_iri>`.
    pub fn subjects_of_type(&self, class_iri: &str) -> Vec<Term> {
        self.objects_matching(None, Some(&Term::iri(vocab::RDF_TYPE)), Some(&Term::iri(class_iri)))
            .into_iter()
            .map(|(s, _, _)| self.term(s).clone())
            .collect()
    }

    /// Object terms of `(subject, predicate, ?)`.
    pub fn objects(&self, subject: &Term, predicate: &str) -> Vec<Term> {
        self.objects_matching(Some(subject), Some(&Term::iri(predicate)), None)
            .into_iter()
            .map(|(_, _, o)| self.term(o).clone())
            .collect()
    }

    /// Subject terms of `(?, predicate, object)`.
    pub fn subjects(&self, predicate: &str, object: &Term) -> Vec<Term> {
        self.objects_matching(None, Some(&Term::iri(predicate)), Some(object))
            .into_iter()
            .map(|(s, _, _)| self.term(s).clone())
            .collect()
    }

    /// First literal object of `(subject, predicate, ?)`, as text.
    pub fn literal(&self, subject: &Term, predicate: &str) -> Option<String> {
        self.objects(subject, predicate)
            .into_iter()
            .next()
            .map(|t| t.as_text().to_string())
    }

    fn objects_matching(
        &self,
        s: Option<&Term>,
        p: Option<&Term>,
        o: Option<&Term>,
    ) -> Vec<(TermId, TermId, TermId)> {
        let s_id = match s.map(|t| self.term_id(t)) {
            Some(None) => return Vec::new(),
            Some(Some(id)) => Some(id),
            None => None,
        };
        let p_id = match p.map(|t| self.term_id(t)) {
            Some(None) => return Vec::new(),
            Some(Some(id)) => Some(id),
            None => None,
        };
        let o_id = match o.map(|t| self.term_id(t)) {
            Some(None) => return Vec::new(),
            Some(Some(id)) => Some(id),
            None => None,
        };

        let candidates: Box<dyn Iterator<Item = &(TermId, TermId, TermId)> + '_> = match p_id {
            Some(p_id) => match self.by_predicate.get(&p_id) {
                Some(idxs) => Box::new(idxs.iter().map(move |&i| &self.triples[i])),
                None => return Vec::new(),
            },
            None => Box::new(self.triples.iter()),
        };

        candidates
            .filter(|(ts, tp, to)| {
                s_id.map(|id| id == *ts).unwrap_or(true)
                    && p_id.map(|id| id == *tp).unwrap_or(true)
                    && o_id.map(|id| id == *to).unwrap_or(true)
            })
            .copied()
            .collect()
    }

    /// Evaluate a basic graph pattern with pre-bound variables.
    ///
    /// Returns one binding set per solution; patterns are joined left to
    /// right, so placing the most selective pattern first keeps the
    /// search narrow.
    pub fn select(&self, patterns: &[TriplePattern], bindings: &Bindings) -> Vec<Bindings> {
        let mut solutions = vec![bindings.clone()];

        for pattern in patterns {
            let mut next = Vec::new();
            for solution in &solutions {
                let s = resolve(&pattern.subject, solution);
                let p = resolve(&pattern.predicate, solution);
                let o = resolve(&pattern.object, solution);

                for (ts, tp, to) in
                    self.objects_matching(s.as_ref(), p.as_ref(), o.as_ref())
                {
                    let mut extended = solution.clone();
                    if !bind(&pattern.subject, self.term(ts), &mut extended)
                        || !bind(&pattern.predicate, self.term(tp), &mut extended)
                        || !bind(&pattern.object, self.term(to), &mut extended)
                    {
                        continue;
                    }
                    next.push(extended);
                }
            }
            solutions = next;
            if solutions.is_empty() {
                break;
            }
        }

        solutions
    }
}

fn resolve(pattern: &Pattern, bindings: &Bindings) -> Option<Term> {
    match pattern {
        Pattern::Term(t) => Some(t.clone()),
        Pattern::Var(v) => bindings.get(v).cloned(),
    }
}

fn bind(pattern: &Pattern, term: &Term, bindings: &mut Bindings) -> bool {
    match pattern {
        Pattern::Term(t) => t == term,
        Pattern::Var(v) => match bindings.get(v) {
            Some(bound) => bound == term,
            None => {
                bindings.insert(v.clone(), term.clone());
                true
            }
        },
    }
}
