//! Binary graph section
//!
//! ```text
//! magic           [u8; 8]  "LKXGRAPH"
//! num_nodes       u32 LE
//! entry_point     u32 LE   (u32::MAX when empty)
//! max_layer       u8
//! m, m0, ef_c     u32 LE × 3
//! seed            u64 LE
//! per node (position order):
//!   top_layer     u8
//!   per layer 0..=top_layer:
//!     count       u32 LE
//!     neighbors   [u32 LE; count]
//! ```
//!
//! Node ids are implicit: the `n`th node is store position `n`.

use std::io::{self, Read, Write};

use super::graph::{Hnsw, Node};

pub(crate) const GRAPH_MAGIC: [u8; 8] = *b"LKXGRAPH";

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn read_u8<R: Read>(reader: &mut R) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32<R: Read>(reader: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn to_u32(value: usize, what: &str) -> io::Result<u32> {
    u32::try_from(value).map_err(|_| invalid(format!("{} {} exceeds u32", what, value)))
}

impl Hnsw {
    /// Write the graph section
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&GRAPH_MAGIC)?;
        writer.write_all(&to_u32(self.nodes.len(), "node count")?.to_le_bytes())?;
        let entry = match self.entry_point {
            Some(id) => to_u32(id, "entry point")?,
            None => u32::MAX,
        };
        writer.write_all(&entry.to_le_bytes())?;
        writer.write_all(&[self.max_layer as u8])?;
        writer.write_all(&to_u32(self.m, "m")?.to_le_bytes())?;
        writer.write_all(&to_u32(self.m0, "m0")?.to_le_bytes())?;
        writer.write_all(&to_u32(self.ef_construction, "ef_construction")?.to_le_bytes())?;
        writer.write_all(&self.seed.to_le_bytes())?;

        for node in &self.nodes {
            writer.write_all(&[node.top_layer() as u8])?;
            for neighbors in &node.layers {
                writer.write_all(&to_u32(neighbors.len(), "neighbor count")?.to_le_bytes())?;
                for &n in neighbors {
                    writer.write_all(&to_u32(n, "neighbor id")?.to_le_bytes())?;
                }
            }
        }
        Ok(())
    }

    /// Read a graph section written by [`Hnsw::write_to`].
    ///
    /// Structural damage (bad magic, ids out of bounds, a node count other
    /// than `expected_nodes`) is reported as `InvalidData`.
    pub fn read_from<R: Read>(reader: &mut R, expected_nodes: usize) -> io::Result<Self> {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if magic != GRAPH_MAGIC {
            return Err(invalid("invalid graph magic"));
        }

        let num_nodes = read_u32(reader)? as usize;
        if num_nodes != expected_nodes {
            return Err(invalid(format!(
                "graph has {} nodes, expected {}",
                num_nodes, expected_nodes
            )));
        }
        let entry_point = match read_u32(reader)? {
            u32::MAX => None,
            id => Some(id as usize),
        };
        let max_layer = read_u8(reader)? as usize;
        let m = read_u32(reader)? as usize;
        let m0 = read_u32(reader)? as usize;
        let ef_construction = read_u32(reader)? as usize;
        let seed = read_u64(reader)?;

        let mut nodes = Vec::with_capacity(num_nodes);
        for _ in 0..num_nodes {
            let top_layer = read_u8(reader)? as usize;
            if top_layer > max_layer {
                return Err(invalid(format!(
                    "node layer {} above graph max layer {}",
                    top_layer, max_layer
                )));
            }
            let mut layers = Vec::with_capacity(top_layer + 1);
            for _ in 0..=top_layer {
                let count = read_u32(reader)? as usize;
                if count > num_nodes {
                    return Err(invalid(format!("neighbor count {} exceeds node count", count)));
                }
                let mut neighbors = Vec::with_capacity(count);
                for _ in 0..count {
                    neighbors.push(read_u32(reader)? as usize);
                }
                layers.push(neighbors);
            }
            nodes.push(Node { layers });
        }

        let graph = Hnsw::from_parts(nodes, entry_point, max_layer, m, m0, ef_construction, seed);
        graph.validate(expected_nodes).map_err(invalid)?;
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::VectorStore;

    fn sample_graph() -> (VectorStore, Hnsw) {
        let mut store = VectorStore::new(3);
        let mut hnsw = Hnsw::new(4, 20, 11);
        for i in 0..40 {
            let f = i as f32;
            store
                .append(&[f.sin(), f.cos(), f * 0.01], &format!("p{}", i))
                .unwrap();
            hnsw.insert(i, &store);
        }
        (store, hnsw)
    }

    #[test]
    fn test_decoded_graph_searches_identically() {
        let (store, hnsw) = sample_graph();
        let mut buf = Vec::new();
        hnsw.write_to(&mut buf).unwrap();

        let decoded = Hnsw::read_from(&mut buf.as_slice(), store.size()).unwrap();
        assert_eq!(decoded.nodes, hnsw.nodes);
        assert_eq!(decoded.entry_point, hnsw.entry_point);
        assert_eq!(decoded.seed, 11);

        let q = [0.3f32, -0.2, 0.1];
        assert_eq!(decoded.search(&q, 5, 20, &store), hnsw.search(&q, 5, 20, &store));
    }

    #[test]
    fn test_rejects_wrong_node_count() {
        let (store, hnsw) = sample_graph();
        let mut buf = Vec::new();
        hnsw.write_to(&mut buf).unwrap();
        let err = Hnsw::read_from(&mut buf.as_slice(), store.size() + 1).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_rejects_bad_magic_and_truncation() {
        let (store, hnsw) = sample_graph();
        let mut buf = Vec::new();
        hnsw.write_to(&mut buf).unwrap();

        let mut bad = buf.clone();
        bad[0] = b'X';
        assert!(Hnsw::read_from(&mut bad.as_slice(), store.size()).is_err());

        let truncated = &buf[..buf.len() - 3];
        assert!(Hnsw::read_from(&mut &truncated[..], store.size()).is_err());
    }

    #[test]
    fn test_empty_graph() {
        let hnsw = Hnsw::new(8, 10, 0);
        let mut buf = Vec::new();
        hnsw.write_to(&mut buf).unwrap();
        let decoded = Hnsw::read_from(&mut buf.as_slice(), 0).unwrap();
        assert!(decoded.is_empty());
        assert_eq!(decoded.entry_point(), None);
    }
}
